//! `schedule list|cancel|cancel-all` (spec.md §6, §9): an in-memory,
//! mutex-guarded registry of scheduled tasks local to this process. Per the
//! redesign notes, cross-process cancellation is explicitly out of scope —
//! the ops interface for that is editing the sheet directly.

use std::sync::Mutex;

use subcycle_model::TransitionKind;

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    pub email: String,
    pub kind: TransitionKind,
}

#[derive(Default)]
pub struct ScheduleRegistry {
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: ScheduledTask) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn list(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().unwrap().clone()
    }

    /// Returns true if a task with this id was present and removed.
    pub fn cancel(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        tasks.len() != before
    }

    pub fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        let count = tasks.len();
        tasks.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_removes_only_the_matching_task() {
        let registry = ScheduleRegistry::new();
        registry.register(ScheduledTask {
            id: "t1".into(),
            email: "a@example.com".into(),
            kind: TransitionKind::Pause,
        });
        registry.register(ScheduledTask {
            id: "t2".into(),
            email: "b@example.com".into(),
            kind: TransitionKind::Resume,
        });

        assert!(registry.cancel("t1"));
        assert!(!registry.cancel("t1"));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].id, "t2");
    }

    #[test]
    fn cancel_all_empties_the_registry() {
        let registry = ScheduleRegistry::new();
        registry.register(ScheduledTask {
            id: "t1".into(),
            email: "a@example.com".into(),
            kind: TransitionKind::Pause,
        });
        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.list().is_empty());
    }
}
