use std::sync::Arc;

use canopy_core::RankId;

use super::*;
use crate::table::PointTable;

const HERE: RankId = RankId(0);
const PEER: RankId = RankId(1);

/// Frontier fragments of a 64-point line table with leaf size 4:
/// sixteen disjoint 4-point fragments.
fn leaves() -> Vec<SubTreeFragment> {
    let points: Vec<f64> = (0..64).map(|i| i as f64).collect();
    let table = Arc::new(PointTable::build(HERE, 1, points, 0, vec![], 4).unwrap());
    table
        .frontier(4)
        .into_iter()
        .map(|node| SubTreeFragment::borrowed(Arc::clone(&table), node).unwrap())
        .collect()
}

#[test]
fn pops_largest_work_first() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_task(q, f[1].clone(), 5).unwrap();
    queue.push_task(q, f[2].clone(), 50).unwrap();
    queue.push_task(q, f[3].clone(), 20).unwrap();

    let order: Vec<u64> = std::iter::from_fn(|| queue.pop_highest_priority(q).unwrap())
        .map(|t| t.work)
        .collect();
    assert_eq!(order, vec![50, 20, 5]);
}

#[test]
fn equal_keys_pop_in_push_order() {
    let f = leaves();
    let mut queue = TaskQueue::with_policy(HERE, u64::MAX, InsertionOrder);
    let q = queue.push_query(f[0].clone()).unwrap();
    for (i, frag) in f[1..5].iter().enumerate() {
        queue.push_task(q, frag.clone(), 100 - i as u64).unwrap();
    }
    let refs: Vec<_> = std::iter::from_fn(|| queue.pop_highest_priority(q).unwrap())
        .map(|t| t.reference)
        .collect();
    let expected: Vec<_> = f[1..5].iter().map(|f| f.identity()).collect();
    assert_eq!(refs, expected);
}

#[test]
fn work_accounting_follows_pushes_pops_and_finishes() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_task(q, f[1].clone(), 30).unwrap();
    queue.push_task(q, f[2].clone(), 12).unwrap();
    assert_eq!(queue.remaining_work(q).unwrap(), 42);
    assert_eq!(queue.outstanding_work(), 42);

    let task = queue.pop_highest_priority(q).unwrap().unwrap();
    assert_eq!(queue.remaining_work(q).unwrap(), 12);
    assert_eq!(queue.outstanding_work(), 42, "popped but unfinished work is still outstanding");

    queue.finish_task(task).unwrap();
    assert_eq!(queue.outstanding_work(), 12);

    queue.decrement_outstanding_work(1_000);
    assert_eq!(queue.outstanding_work(), 0);
}

#[test]
fn finished_task_releases_its_reference_claim() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, 12);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_task(q, f[1].clone(), 1).unwrap();
    queue.push_task(q, f[1].clone(), 1).unwrap();
    assert_eq!(queue.cache().remaining_budget(), 4, "shared reference charged once");

    let first = queue.pop_highest_priority(q).unwrap().unwrap();
    queue.finish_task(first).unwrap();
    assert!(queue.cache().find(f[1].identity()).is_some());

    let second = queue.pop_highest_priority(q).unwrap().unwrap();
    queue.finish_task(second).unwrap();
    assert!(queue.cache().find(f[1].identity()).is_none());
    assert_eq!(queue.cache().remaining_budget(), 8);
}

#[test]
fn push_pair_estimates_product_of_point_counts() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_pair(q, f[1].clone()).unwrap();
    assert_eq!(queue.remaining_work(q).unwrap(), 16);
}

#[test]
fn locked_query_refuses_pop_push_and_second_lock() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_task(q, f[1].clone(), 3).unwrap();

    queue.lock_query(q, PEER).unwrap();
    assert!(queue.is_locked(q));
    assert_eq!(queue.lock_holder(q), Some(PEER));
    assert_eq!(
        queue.pop_highest_priority(q),
        Err(QueueError::Locked { query: q, holder: PEER })
    );
    assert!(matches!(queue.lock_query(q, RankId(2)), Err(QueueError::Locked { .. })));
    assert!(matches!(queue.push_task(q, f[2].clone(), 1), Err(QueueError::Locked { .. })));
    assert!(queue.candidates().is_empty());

    queue.unlock(q).unwrap();
    assert_eq!(queue.unlock(q), Err(QueueError::NotLocked(q)));
    assert!(queue.pop_highest_priority(q).unwrap().is_some());
}

#[test]
fn unknown_query_is_reported() {
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let ghost = QuerySlot(7);
    assert_eq!(queue.pop_highest_priority(ghost), Err(QueueError::UnknownQuery(ghost)));
    assert_eq!(queue.lock_query(ghost, PEER), Err(QueueError::UnknownQuery(ghost)));
    assert!(!queue.is_locked(ghost));
}

#[test]
fn duplicate_query_and_full_cache_are_rejected() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, 6);
    queue.push_query(f[0].clone()).unwrap();
    assert_eq!(
        queue.push_query(f[0].clone()),
        Err(QueueError::DuplicateQuery(f[0].identity()))
    );
    assert!(matches!(
        queue.push_query(f[1].clone()),
        Err(QueueError::CacheFull { required: 4, remaining: 2, .. })
    ));
    assert_eq!(queue.len(), 1);
}

#[test]
fn settle_retires_drained_entries_and_resumes_others() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let drained = queue.push_query(f[0].clone()).unwrap();
    let busy = queue.push_query(f[1].clone()).unwrap();
    queue.push_task(busy, f[2].clone(), 1).unwrap();

    queue.lock_query(drained, PEER).unwrap();
    queue.lock_query(busy, PEER).unwrap();

    assert_eq!(queue.settle(drained), Ok(Settled::Retired));
    assert!(queue.find_query(f[0].identity()).is_none());
    assert!(queue.cache().find(f[0].identity()).is_none());

    assert_eq!(queue.settle(busy), Ok(Settled::Resumed));
    assert_eq!(queue.candidates(), vec![busy]);
}

#[test]
fn retire_requires_drained_unlocked_entry() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let q = queue.push_query(f[0].clone()).unwrap();
    queue.push_task(q, f[1].clone(), 1).unwrap();
    assert_eq!(queue.retire_query(q), Err(QueueError::NotDrained(q)));

    let task = queue.pop_highest_priority(q).unwrap().unwrap();
    queue.finish_task(task).unwrap();
    queue.retire_query(q).unwrap();
    assert!(queue.is_empty());
    assert!(queue.cache().is_empty());
}

#[test]
fn origin_defaults_to_local_rank() {
    let f = leaves();
    let mut queue = TaskQueue::new(HERE, u64::MAX);
    let local = queue.push_query(f[0].clone()).unwrap();
    let remote = queue.adopt_query(f[1].clone(), PEER).unwrap();
    assert_eq!(queue.origin(local), Some(HERE));
    assert_eq!(queue.origin(remote), Some(PEER));
}
