//! Ordered set of live workers.

use crate::envelope::WorkerId;

/// Live worker ids in start order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSet {
    workers: Vec<WorkerId>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `worker_id`. Returns false if it was already present.
    pub fn add(&mut self, worker_id: WorkerId) -> bool {
        if self.workers.contains(&worker_id) {
            return false;
        }
        self.workers.push(worker_id);
        true
    }

    /// Remove `worker_id`, keeping the others in order.
    pub fn remove(&mut self, worker_id: WorkerId) -> bool {
        let before = self.workers.len();
        self.workers.retain(|id| *id != worker_id);
        self.workers.len() != before
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.contains(&worker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.iter().copied()
    }

    pub fn as_slice(&self) -> &[WorkerId] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(ids: &[WorkerId]) -> WorkerSet {
        let mut set = WorkerSet::new();
        for id in ids {
            set.add(*id);
        }
        set
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let mut set = WorkerSet::new();
        assert!(set.add(1));
        assert!(!set.add(1));
        assert_eq!(set.as_slice(), &[1]);
    }

    #[test]
    fn test_remove_from_start_middle_end() {
        for (victim, expected) in [(1, vec![2, 3]), (2, vec![1, 3]), (3, vec![1, 2])] {
            let mut set = set_of(&[1, 2, 3]);
            assert!(set.remove(victim));
            assert!(!set.contains(victim));
            assert_eq!(set.as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut set = set_of(&[4, 5]);
        assert!(!set.remove(9));
        assert_eq!(set.len(), 2);
    }
}
