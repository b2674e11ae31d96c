//! Per-rank task queue: query fragments, each with a priority-ordered list of
//! reference fragments still to visit.
//!
//! Every fragment a queue entry names is held in the queue's own
//! [`FragmentCache`]: the query in the query role, each pending reference
//! with one reference claim. A query can be locked on behalf of another rank
//! (after its tasks were donated); a locked query accepts no local pops or
//! pushes until it is settled.

mod priority;
#[cfg(test)]
mod tests;

use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use tracing::debug;

use canopy_core::{FragmentIdentity, RankId, SlotId};

use crate::cache::FragmentCache;
use crate::error::QueueError;
use crate::fragment::SubTreeFragment;

pub use priority::{InsertionOrder, LargestWorkFirst, PriorityPolicy};
use priority::Ranked;

/// Position of a query entry inside a [`TaskQueue`]. Stable for the life of
/// the entry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySlot(pub usize);

impl fmt::Display for QuerySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query#{}", self.0)
    }
}

/// One pending (query, reference) visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub reference: FragmentIdentity,
    /// Cache slot holding the reference claim for this task.
    pub reference_slot: SlotId,
    pub work: u64,
}

/// What [`TaskQueue::settle`] did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// No local tasks were left; the entry is gone and its query claim released.
    Retired,
    /// Local tasks remain; the entry is schedulable again.
    Resumed,
}

#[derive(Debug)]
struct QueryEntry<K> {
    query: FragmentIdentity,
    query_slot: SlotId,
    origin: RankId,
    lock_holder: Option<RankId>,
    pending: BinaryHeap<Ranked<K>>,
    remaining_work: u64,
}

#[derive(Debug)]
pub struct TaskQueue<P: PriorityPolicy = LargestWorkFirst> {
    rank: RankId,
    cache: FragmentCache,
    entries: Vec<Option<QueryEntry<P::Key>>>,
    by_identity: HashMap<FragmentIdentity, QuerySlot>,
    policy: P,
    outstanding_work: u64,
    next_seq: u64,
}

impl TaskQueue<LargestWorkFirst> {
    pub fn new(rank: RankId, cache_points: u64) -> Self {
        Self::with_policy(rank, cache_points, LargestWorkFirst)
    }
}

impl<P: PriorityPolicy> TaskQueue<P> {
    pub fn with_policy(rank: RankId, cache_points: u64, policy: P) -> Self {
        Self {
            rank,
            cache: FragmentCache::new(cache_points),
            entries: Vec::new(),
            by_identity: HashMap::new(),
            policy,
            outstanding_work: 0,
            next_seq: 0,
        }
    }

    pub fn rank(&self) -> RankId {
        self.rank
    }

    pub fn cache(&self) -> &FragmentCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut FragmentCache {
        &mut self.cache
    }

    // ── Insertion ─────────────────────────────────────────────

    /// Open a new entry for a query fragment that originates on this rank.
    pub fn push_query(&mut self, fragment: SubTreeFragment) -> Result<QuerySlot, QueueError> {
        let origin = self.rank;
        self.adopt_query(fragment, origin)
    }

    /// Open a new entry for `fragment`, recording `origin` as the rank its
    /// results belong to.
    pub fn adopt_query(
        &mut self,
        fragment: SubTreeFragment,
        origin: RankId,
    ) -> Result<QuerySlot, QueueError> {
        let identity = fragment.identity();
        if self.by_identity.contains_key(&identity) {
            return Err(QueueError::DuplicateQuery(identity));
        }
        let slot = self.cache.admit(fragment, true).map_err(QueueError::from)?;
        self.open_entry(identity, slot, origin)
    }

    /// Open an entry for a query whose query claim is already held in the cache.
    pub(crate) fn open_entry(
        &mut self,
        query: FragmentIdentity,
        query_slot: SlotId,
        origin: RankId,
    ) -> Result<QuerySlot, QueueError> {
        if self.by_identity.contains_key(&query) {
            return Err(QueueError::DuplicateQuery(query));
        }
        let slot = QuerySlot(self.entries.len());
        self.entries.push(Some(QueryEntry {
            query,
            query_slot,
            origin,
            lock_holder: None,
            pending: BinaryHeap::new(),
            remaining_work: 0,
        }));
        self.by_identity.insert(query, slot);
        debug!(rank = %self.rank, %query, %slot, %origin, "query entry opened");
        Ok(slot)
    }

    /// Queue a visit of `reference` for `query`, estimated at `work`.
    pub fn push_task(
        &mut self,
        query: QuerySlot,
        reference: SubTreeFragment,
        work: u64,
    ) -> Result<(), QueueError> {
        self.unlocked_entry(query)?;
        let identity = reference.identity();
        let reference_slot = self.cache.admit(reference, false).map_err(QueueError::from)?;
        self.enqueue(
            query,
            Task {
                reference: identity,
                reference_slot,
                work,
            },
        )
    }

    /// Queue a visit with the default estimate: product of both point counts.
    pub fn push_pair(&mut self, query: QuerySlot, reference: SubTreeFragment) -> Result<(), QueueError> {
        let query_points = self.entry(query)?.query.point_count();
        let work = query_points.saturating_mul(reference.point_count());
        self.push_task(query, reference, work)
    }

    /// Put a task whose reference claim is already held back into `query`.
    pub(crate) fn enqueue(&mut self, query: QuerySlot, task: Task) -> Result<(), QueueError> {
        let seq = self.next_seq;
        let entry = self
            .entries
            .get_mut(query.0)
            .and_then(Option::as_mut)
            .ok_or(QueueError::UnknownQuery(query))?;
        let key = self.policy.key(entry.query, &task);
        entry.remaining_work = entry.remaining_work.saturating_add(task.work);
        self.outstanding_work = self.outstanding_work.saturating_add(task.work);
        entry.pending.push(Ranked { key, seq, task });
        self.next_seq += 1;
        Ok(())
    }

    // ── Scheduling ────────────────────────────────────────────

    /// The task [`pop_highest_priority`](Self::pop_highest_priority) would return next.
    pub fn peek(&self, query: QuerySlot) -> Result<Option<&Task>, QueueError> {
        Ok(self.entry(query)?.pending.peek().map(|r| &r.task))
    }

    /// Remove the next reference task of `query`.
    ///
    /// The task keeps its reference claim; hand it back through
    /// [`finish_task`](Self::finish_task) once visited.
    pub fn pop_highest_priority(&mut self, query: QuerySlot) -> Result<Option<Task>, QueueError> {
        let entry = self.unlocked_entry(query)?;
        let task = entry.pending.pop().map(|r| r.task);
        if let Some(task) = &task {
            entry.remaining_work = entry.remaining_work.saturating_sub(task.work);
        }
        Ok(task)
    }

    /// Account for a visited task: drop its reference claim and its work.
    pub fn finish_task(&mut self, task: Task) -> Result<(), QueueError> {
        self.cache.release_slot(task.reference_slot, false)?;
        self.decrement_outstanding_work(task.work);
        Ok(())
    }

    /// Sum of work estimates of `query`'s pending tasks.
    pub fn remaining_work(&self, query: QuerySlot) -> Result<u64, QueueError> {
        Ok(self.entry(query)?.remaining_work)
    }

    /// Rank-wide estimate of computation still to be done here.
    pub fn outstanding_work(&self) -> u64 {
        self.outstanding_work
    }

    pub fn decrement_outstanding_work(&mut self, amount: u64) {
        self.outstanding_work = self.outstanding_work.saturating_sub(amount);
    }

    // ── Locking ───────────────────────────────────────────────

    pub fn lock_query(&mut self, query: QuerySlot, claimant: RankId) -> Result<(), QueueError> {
        let rank = self.rank;
        let entry = self.unlocked_entry(query)?;
        entry.lock_holder = Some(claimant);
        debug!(%rank, %query, %claimant, "query locked");
        Ok(())
    }

    pub fn unlock(&mut self, query: QuerySlot) -> Result<(), QueueError> {
        let entry = self.entry_mut(query)?;
        if entry.lock_holder.take().is_none() {
            return Err(QueueError::NotLocked(query));
        }
        Ok(())
    }

    pub fn is_locked(&self, query: QuerySlot) -> bool {
        self.lock_holder(query).is_some()
    }

    pub fn lock_holder(&self, query: QuerySlot) -> Option<RankId> {
        self.entry(query).ok().and_then(|e| e.lock_holder)
    }

    /// Completion signal for a donated query: unlock it, then retire the
    /// entry if nothing is left to do locally.
    pub fn settle(&mut self, query: QuerySlot) -> Result<Settled, QueueError> {
        self.unlock(query)?;
        if self.entry(query)?.pending.is_empty() {
            self.retire_query(query)?;
            Ok(Settled::Retired)
        } else {
            Ok(Settled::Resumed)
        }
    }

    /// Remove a drained, unlocked entry and release its query claim.
    pub fn retire_query(&mut self, query: QuerySlot) -> Result<(), QueueError> {
        let entry = self.unlocked_entry(query)?;
        if !entry.pending.is_empty() {
            return Err(QueueError::NotDrained(query));
        }
        let query_slot = entry.query_slot;
        let identity = entry.query;
        self.cache.release_slot(query_slot, true)?;
        self.entries[query.0] = None;
        self.by_identity.remove(&identity);
        debug!(rank = %self.rank, query = %identity, slot = %query, "query entry retired");
        Ok(())
    }

    // ── Inspection ────────────────────────────────────────────

    /// Rank whose results `query` contributes to.
    pub fn origin(&self, query: QuerySlot) -> Option<RankId> {
        self.entry(query).ok().map(|e| e.origin)
    }

    pub fn query_identity(&self, query: QuerySlot) -> Option<FragmentIdentity> {
        self.entry(query).ok().map(|e| e.query)
    }

    pub fn query_fragment(&self, query: QuerySlot) -> Option<&SubTreeFragment> {
        let entry = self.entry(query).ok()?;
        self.cache.fragment(entry.query_slot)
    }

    pub fn find_query(&self, identity: FragmentIdentity) -> Option<QuerySlot> {
        self.by_identity.get(&identity).copied()
    }

    pub fn task_count(&self, query: QuerySlot) -> usize {
        self.entry(query).map(|e| e.pending.len()).unwrap_or(0)
    }

    /// Live entries in slot order.
    pub fn queries(&self) -> impl Iterator<Item = QuerySlot> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| QuerySlot(i))
    }

    /// Unlocked entries with pending tasks, in slot order.
    pub fn candidates(&self) -> Vec<QuerySlot> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let e = e.as_ref()?;
                (e.lock_holder.is_none() && !e.pending.is_empty()).then_some(QuerySlot(i))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    fn entry(&self, query: QuerySlot) -> Result<&QueryEntry<P::Key>, QueueError> {
        self.entries
            .get(query.0)
            .and_then(Option::as_ref)
            .ok_or(QueueError::UnknownQuery(query))
    }

    fn entry_mut(&mut self, query: QuerySlot) -> Result<&mut QueryEntry<P::Key>, QueueError> {
        self.entries
            .get_mut(query.0)
            .and_then(Option::as_mut)
            .ok_or(QueueError::UnknownQuery(query))
    }

    fn unlocked_entry(&mut self, query: QuerySlot) -> Result<&mut QueryEntry<P::Key>, QueueError> {
        let entry = self.entry_mut(query)?;
        match entry.lock_holder {
            Some(holder) => Err(QueueError::Locked { query, holder }),
            None => Ok(entry),
        }
    }
}
