//! Multi-rank donation flows driven directly through the library API,
//! with bundle bytes passed between queues by hand.

use std::sync::Arc;

use canopy_core::RankId;
use canopy_exchange::*;

fn fragments(rank: RankId, n: usize, fragment_points: usize) -> Vec<SubTreeFragment> {
    let points: Vec<f64> = (0..n * 2).map(|i| ((i * 7919) % 101) as f64).collect();
    let weights: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let table = Arc::new(PointTable::build(rank, 2, points, 1, weights, 4).unwrap());
    table
        .frontier(fragment_points)
        .into_iter()
        .map(|node| SubTreeFragment::borrowed(Arc::clone(&table), node).unwrap())
        .collect()
}

/// Every fragment queried against every fragment.
fn all_pairs<P: PriorityPolicy>(queue: &mut TaskQueue<P>, frags: &[SubTreeFragment]) -> u64 {
    for q in frags {
        let slot = queue.push_query(q.alias()).unwrap();
        for r in frags {
            queue.push_pair(slot, r.alias()).unwrap();
        }
    }
    queue.outstanding_work()
}

/// Visit every runnable task, checking both fragments are readable.
fn drain<P: PriorityPolicy>(queue: &mut TaskQueue<P>) -> u64 {
    let mut work = 0;
    for query in queue.candidates() {
        while let Some(task) = queue.pop_highest_priority(query).unwrap() {
            let q = queue.query_fragment(query).unwrap();
            let r = queue.cache().fragment(task.reference_slot).unwrap();
            let span = r.span();
            assert!(r.point(span.begin).is_some(), "reference rows shipped");
            assert!(q.point(q.span().begin).is_some(), "query rows shipped");
            work += task.work;
            queue.finish_task(task).unwrap();
        }
    }
    work
}

/// Retire drained entries, returning the identities that belong elsewhere.
fn retire_drained<P: PriorityPolicy>(queue: &mut TaskQueue<P>) -> Vec<(RankId, canopy_core::FragmentIdentity)> {
    let drained: Vec<_> = queue
        .queries()
        .filter(|q| !queue.is_locked(*q) && queue.task_count(*q) == 0)
        .collect();
    let mut settlements = Vec::new();
    for q in drained {
        let origin = queue.origin(q).unwrap();
        let identity = queue.query_identity(q).unwrap();
        queue.retire_query(q).unwrap();
        if origin != queue.rank() {
            settlements.push((origin, identity));
        }
    }
    settlements
}

#[test]
fn work_spreads_over_three_ranks_and_comes_back_settled() {
    let mut ranks: Vec<TaskQueue> = (0..3).map(|r| TaskQueue::new(RankId(r), u64::MAX)).collect();
    let frags = fragments(RankId(0), 96, 24);
    let total = all_pairs(&mut ranks[0], &frags);

    let mut visited = 0;
    for taker in [1u32, 2] {
        let mut bundle = DonationBundle::new(RankId(0), RankId(taker), 60);
        let donated = bundle.fill(&mut ranks[0]).unwrap();
        assert!(donated > 0);
        let (bytes, pending) = bundle.export();
        let imported = import_donation(&mut ranks[taker as usize], &bytes.unwrap()).unwrap();
        assert_eq!(imported.source, RankId(0));
        assert!(imported.points <= 60);
        assert_eq!(imported.work, pending.work());
        pending.release_cache(&mut ranks[0]).unwrap();
    }

    for rank in &mut ranks {
        visited += drain(rank);
    }
    assert!(visited < total, "donated queries stay locked on the donor");
    assert!(retire_drained(&mut ranks[0]).is_empty(), "local entries retire silently");

    for taker in [1usize, 2] {
        for (origin, identity) in retire_drained(&mut ranks[taker]) {
            assert_eq!(origin, RankId(0));
            let slot = ranks[0].find_query(identity).unwrap();
            assert_eq!(ranks[0].lock_holder(slot), Some(RankId(taker as u32)));
            assert_eq!(ranks[0].settle(slot).unwrap(), Settled::Resumed);
        }
        assert!(ranks[taker].is_empty());
        assert_eq!(ranks[taker].cache().resident_points(), 0, "taker cache drained");
    }

    // Settled queries still had tasks the bundles could not fit.
    visited += drain(&mut ranks[0]);
    assert_eq!(visited, total);
    retire_drained(&mut ranks[0]);
    assert!(ranks[0].is_empty());
    assert_eq!(ranks[0].cache().resident_points(), 0);
    assert_eq!(ranks[0].cache().remaining_budget(), u64::MAX);
}

#[test]
fn lost_bundle_is_reclaimed_and_sent_elsewhere() {
    let mut donor = TaskQueue::with_policy(RankId(0), u64::MAX, InsertionOrder);
    let mut other = TaskQueue::with_policy(RankId(2), u64::MAX, InsertionOrder);
    let frags = fragments(RankId(0), 32, 16);
    let total = all_pairs(&mut donor, &frags);

    let mut bundle = DonationBundle::new(RankId(0), RankId(1), 1_000);
    bundle.fill(&mut donor).unwrap();
    let (_lost, pending) = bundle.export();
    assert_eq!(donor.outstanding_work(), total - pending.work());
    pending.reclaim(&mut donor).unwrap();
    assert_eq!(donor.outstanding_work(), total);

    let mut bundle = DonationBundle::new(RankId(0), RankId(2), 1_000);
    bundle.fill(&mut donor).unwrap();
    let (bytes, pending) = bundle.export();
    let imported = import_donation(&mut other, &bytes.unwrap()).unwrap();
    assert_eq!(imported.work, total);
    pending.release_cache(&mut donor).unwrap();
    assert_eq!(drain(&mut other), total);
}

#[test]
fn bundle_for_one_rank_is_refused_by_another() {
    let mut donor = TaskQueue::new(RankId(0), u64::MAX);
    let mut bystander = TaskQueue::new(RankId(3), u64::MAX);
    all_pairs(&mut donor, &fragments(RankId(0), 32, 16));

    let mut bundle = DonationBundle::new(RankId(0), RankId(1), 1_000);
    bundle.fill(&mut donor).unwrap();
    let (bytes, pending) = bundle.export();
    let err = import_donation(&mut bystander, &bytes.unwrap()).unwrap_err();
    assert!(matches!(err, DonationError::WrongDestination { .. }));
    assert!(bystander.is_empty());
    pending.reclaim(&mut donor).unwrap();
}
