use std::collections::BTreeMap;

use tracing::{debug, info};

use canopy_core::{RankId, SlotId};

use crate::cache::{FragmentCache, Rejected};
use crate::error::{CacheFault, DonationError, QueueError};
use crate::fragment::SubTreeFragment;
use crate::queue::{PriorityPolicy, QuerySlot, Task, TaskQueue};

use super::pending::{DonatedQuery, PendingDonation};
use super::wire::{WireBundle, WireFragment, WireReference, WireTaskList};

/// Result of offering one query to a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The query and `references` of its tasks joined the bundle; the query
    /// is now locked in the source queue for the destination.
    Donated { references: usize, work: u64 },
    /// Not even the first reference fit. Nothing changed.
    Void,
    /// The query fragment alone exceeds what is left of the budget.
    QueryRejected(Rejected),
}

#[derive(Debug)]
struct BundledQuery {
    query: QuerySlot,
    bundle_slot: SlotId,
    tasks: Vec<(SlotId, Task)>,
}

/// A set of donated queries and the fragments they need, addressed to one
/// rank and limited to a point budget.
///
/// Fragments enter a bundle-local [`FragmentCache`] seeded with the budget,
/// so a fragment shared by several donated tasks is charged and shipped once.
#[derive(Debug)]
pub struct DonationBundle {
    source: RankId,
    destination: RankId,
    budget: u64,
    cache: FragmentCache,
    queries: Vec<BundledQuery>,
    include_reverse_permutation: bool,
}

impl DonationBundle {
    pub fn new(source: RankId, destination: RankId, budget: u64) -> Self {
        Self {
            source,
            destination,
            budget,
            cache: FragmentCache::new(budget),
            queries: Vec::new(),
            include_reverse_permutation: true,
        }
    }

    /// Whether exported fragments carry their new-from-old permutation.
    pub fn include_reverse_permutation(mut self, include: bool) -> Self {
        self.include_reverse_permutation = include;
        self
    }

    pub fn source(&self) -> RankId {
        self.source
    }

    pub fn destination(&self) -> RankId {
        self.destination
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn remaining_budget(&self) -> u64 {
        self.cache.remaining_budget()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn fragment_count(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn cache(&self) -> &FragmentCache {
        &self.cache
    }

    pub fn task_count(&self) -> usize {
        self.queries.iter().map(|q| q.tasks.len()).sum()
    }

    /// Work estimates of every bundled task.
    pub fn work(&self) -> u64 {
        self.queries
            .iter()
            .flat_map(|q| q.tasks.iter())
            .map(|(_, t)| t.work)
            .sum()
    }

    /// Offer `query` from `queue` to this bundle.
    ///
    /// The query fragment is admitted first; then its tasks are taken in
    /// priority order for as long as their reference fragments fit. The first
    /// reference that does not fit ends the walk, even if a later, smaller one
    /// would have. Each accepted task is popped from `queue` and its work
    /// leaves the queue's outstanding estimate.
    pub fn try_add_query<P: PriorityPolicy>(
        &mut self,
        queue: &mut TaskQueue<P>,
        query: QuerySlot,
    ) -> Result<BuildOutcome, DonationError> {
        if let Some(holder) = queue.lock_holder(query) {
            return Err(QueueError::Locked { query, holder }.into());
        }
        let fragment = queue
            .query_fragment(query)
            .map(SubTreeFragment::alias)
            .ok_or(QueueError::UnknownQuery(query))?;

        let bundle_slot = match self.cache.admit(fragment, true) {
            Ok(slot) => slot,
            Err(rejected) => {
                debug!(
                    %query,
                    required = rejected.required,
                    remaining = rejected.remaining,
                    "query does not fit bundle"
                );
                return Ok(BuildOutcome::QueryRejected(rejected));
            }
        };

        let mut tasks = Vec::new();
        let mut work = 0u64;
        while let Some(next) = queue.peek(query)?.cloned() {
            let reference = queue.cache().fragment(next.reference_slot).map(SubTreeFragment::alias);
            let Some(reference) = reference else {
                return Err(CacheFault::UnknownSlot(next.reference_slot).into());
            };
            let slot = match self.cache.admit(reference, false) {
                Ok(slot) => slot,
                Err(rejected) => {
                    debug!(
                        %query,
                        reference = %rejected.identity,
                        required = rejected.required,
                        remaining = rejected.remaining,
                        "reference does not fit, stopping"
                    );
                    break;
                }
            };
            let Some(task) = queue.pop_highest_priority(query)? else {
                break;
            };
            queue.decrement_outstanding_work(task.work);
            work += task.work;
            tasks.push((slot, task));
        }

        if tasks.is_empty() {
            self.cache.release_slot(bundle_slot, true)?;
            debug!(%query, "void donation");
            return Ok(BuildOutcome::Void);
        }

        queue.lock_query(query, self.destination)?;
        let references = tasks.len();
        info!(
            source = %self.source,
            destination = %self.destination,
            %query,
            references,
            work,
            remaining = self.cache.remaining_budget(),
            "query donated"
        );
        self.queries.push(BundledQuery {
            query,
            bundle_slot,
            tasks,
        });
        Ok(BuildOutcome::Donated { references, work })
    }

    /// Offer every candidate of `queue` in slot order until the budget is
    /// spent. Returns how many queries were donated.
    pub fn fill<P: PriorityPolicy>(&mut self, queue: &mut TaskQueue<P>) -> Result<usize, DonationError> {
        let mut donated = 0;
        for query in queue.candidates() {
            if self.cache.remaining_budget() == 0 {
                break;
            }
            if let BuildOutcome::Donated { .. } = self.try_add_query(queue, query)? {
                donated += 1;
            }
        }
        Ok(donated)
    }

    /// Consume the bundle. Returns the encoded bytes for the destination and
    /// the donor-side record that must later be either released (hand-off
    /// succeeded) or reclaimed (it did not). An encoding failure still
    /// yields the record so the donor can reclaim.
    pub fn export(self) -> (Result<Vec<u8>, DonationError>, PendingDonation) {
        let bytes = self.encode();
        let points = self.cache.resident_points();

        let mut claims: BTreeMap<SlotId, u32> = BTreeMap::new();
        let queries = self
            .queries
            .into_iter()
            .map(|q| {
                for (_, task) in &q.tasks {
                    *claims.entry(task.reference_slot).or_default() += 1;
                }
                DonatedQuery {
                    query: q.query,
                    tasks: q.tasks.into_iter().map(|(_, t)| t).collect(),
                }
            })
            .collect();

        let pending = PendingDonation::new(
            self.source,
            self.destination,
            claims.into_iter().collect(),
            queries,
            points,
        );
        (bytes, pending)
    }

    fn encode(&self) -> Result<Vec<u8>, DonationError> {
        let positions: BTreeMap<SlotId, u32> = self
            .cache
            .iter()
            .enumerate()
            .map(|(position, (slot, _))| (slot, position as u32))
            .collect();
        let position_of = |slot: SlotId| {
            positions
                .get(&slot)
                .copied()
                .ok_or(CacheFault::UnknownSlot(slot))
        };

        let fragments = self
            .cache
            .iter()
            .map(|(_, entry)| {
                WireFragment::capture(
                    entry.fragment(),
                    entry.role(),
                    self.include_reverse_permutation,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(self.queries.len());
        for q in &self.queries {
            let references = q
                .tasks
                .iter()
                .map(|(slot, task)| {
                    Ok(WireReference {
                        position: position_of(*slot)?,
                        work: task.work,
                    })
                })
                .collect::<Result<Vec<_>, CacheFault>>()?;
            tasks.push(WireTaskList {
                query: position_of(q.bundle_slot)?,
                references,
            });
        }

        let wire = WireBundle {
            source: self.source,
            destination: self.destination,
            fragments,
            tasks,
        };
        wire.encode()
    }
}
