use std::cmp::Ordering;
use std::fmt::Debug;

use canopy_core::FragmentIdentity;

use super::Task;

/// Decides which pending reference task of a query is visited next.
///
/// Higher keys pop first. Tasks with equal keys pop in the order they were
/// pushed.
pub trait PriorityPolicy {
    type Key: Ord + Clone + Debug;

    fn key(&self, query: FragmentIdentity, task: &Task) -> Self::Key;
}

/// Visit the reference with the largest work estimate first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestWorkFirst;

impl PriorityPolicy for LargestWorkFirst {
    type Key = u64;

    fn key(&self, _query: FragmentIdentity, task: &Task) -> u64 {
        task.work
    }
}

/// Plain FIFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertionOrder;

impl PriorityPolicy for InsertionOrder {
    type Key = ();

    fn key(&self, _query: FragmentIdentity, _task: &Task) {}
}

/// Heap entry: policy key first, then earliest push.
#[derive(Debug, Clone)]
pub(crate) struct Ranked<K> {
    pub(crate) key: K,
    pub(crate) seq: u64,
    pub(crate) task: Task,
}

impl<K: Ord> PartialEq for Ranked<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for Ranked<K> {}

impl<K: Ord> PartialOrd for Ranked<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Ranked<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
