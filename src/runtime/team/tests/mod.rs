//! Team unit tests
//!
//! Passive, dedicated and pooled teams each run every assigned task once.

use super::*;
use crossbeam::channel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod selector_tests {
    use super::*;

    #[test]
    fn test_any_accepts_every_team() {
        let selector = TeamSelector::default();
        assert_eq!(selector, TeamSelector::Any);
        assert!(selector.accepts(None));
        assert!(selector.accepts(Some(&TeamId::new("io"))));
    }

    #[test]
    fn test_named_team_accepts_only_itself() {
        let selector = TeamSelector::team("io");
        assert!(selector.accepts(Some(&TeamId::from("io"))));
        assert!(!selector.accepts(Some(&TeamId::from("cpu"))));
        assert!(!selector.accepts(None));
    }

    #[test]
    fn test_team_id_display() {
        assert_eq!(TeamId::new("io").to_string(), "io");
        assert_eq!(TeamId::new("io").as_str(), "io");
    }
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_task_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = Task::new("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(task.state(), TaskState::Ready);
        task.run();
        task.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.name(), "count");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new("a", || {});
        let b = Task::new("b", || {});
        assert_ne!(a.id(), b.id());
    }
}

#[cfg(test)]
mod passive_tests {
    use super::*;

    #[test]
    fn test_passive_runs_inline() {
        let team = PassiveTeam::default();
        assert_eq!(team.name(), "passive");
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        team.assign(Task::new("inline", move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod one_person_tests {
    use super::*;

    #[test]
    fn test_runs_in_assignment_order() {
        let team = OnePersonTeam::new("solo").unwrap();
        let (tx, rx) = channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            team.assign(Task::new(format!("t{}", i), move || {
                tx.send(i).unwrap();
            }))
            .unwrap();
        }
        let order: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_runs_on_dedicated_thread() {
        let team = OnePersonTeam::new("named").unwrap();
        let (tx, rx) = channel::bounded(1);
        team.assign(Task::new("where", move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }))
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("team-named"));
    }

    #[test]
    fn test_assign_after_stop_fails() {
        let team = OnePersonTeam::new("stopped").unwrap();
        team.stop_working();
        let result = team.assign(Task::new("late", || {}));
        assert!(matches!(result, Err(KernelError::TeamStopped(name)) if name == "stopped"));
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;

    #[test]
    fn test_pool_runs_every_task() {
        let team = WorkerPoolTeam::new(
            "pool",
            PoolConfig {
                num_workers: 3,
                idle_timeout: Duration::from_millis(1),
            },
        )
        .unwrap();
        assert_eq!(team.num_workers(), 3);

        let (tx, rx) = channel::unbounded();
        for i in 0..100 {
            let tx = tx.clone();
            team.assign(Task::new("work", move || {
                tx.send(i).unwrap();
            }))
            .unwrap();
        }
        let mut seen: Vec<i32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let team = WorkerPoolTeam::new(
            "tiny",
            PoolConfig {
                num_workers: 0,
                idle_timeout: Duration::from_millis(1),
            },
        )
        .unwrap();
        assert_eq!(team.num_workers(), 1);
    }

    #[test]
    fn test_stop_rejects_new_work() {
        let team = WorkerPoolTeam::new("halt", PoolConfig::default()).unwrap();
        assert!(team.is_running());
        team.stop_working();
        assert!(!team.is_running());
        assert!(team.assign(Task::new("late", || {})).is_err());
    }

    #[test]
    fn test_steal_rate_defaults_to_one() {
        let stats = StealStats::default();
        assert_eq!(stats.success_rate(), 1.0);
        stats.record_success();
        stats.record_failure();
        assert_eq!(stats.success_rate(), 0.5);
    }
}
