//! Runtime kernel
//!
//! Job nodes and the driver loop, teams, assets and their monitors, process
//! and thread state, managed resource containers, cleanup sequencing,
//! escalation and the office tying them together.

pub mod asset;
pub mod cleanup;
pub mod container;
pub mod error;
pub mod escalation;
pub mod ids;
pub mod job;
pub mod office;
pub mod state;
pub mod team;

#[cfg(test)]
pub(crate) mod test_support;
