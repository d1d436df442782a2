//! Identifiers for kernel entities
//!
//! Job nodes, flows, threads and processes each carry a small copyable id.
//! Ids are generated atomically so they are unique across every team.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! kernel_id {
    ($(#[$meta:meta])* $name:ident, $label:literal, $counter:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Generate the next unique id.
            #[inline]
            pub fn next() -> Self {
                $name($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the inner value of the id.
            #[inline]
            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(
                &self,
                f: &mut fmt::Formatter<'_>,
            ) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

kernel_id!(
    /// Identity of a job node, used for idempotent monitor registration.
    JobId,
    "Job",
    NEXT_JOB_ID
);

kernel_id!(
    /// Identity of a flow within a thread.
    FlowId,
    "Flow",
    NEXT_FLOW_ID
);

kernel_id!(
    /// Identity of a thread state.
    ThreadId,
    "Thread",
    NEXT_THREAD_ID
);

kernel_id!(
    /// Identity of a process state.
    ProcessId,
    "Process",
    NEXT_PROCESS_ID
);

kernel_id!(
    /// Identity of an asset monitor within its manager.
    MonitorId,
    "Monitor",
    NEXT_MONITOR_ID
);
