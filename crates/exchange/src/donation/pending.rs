use tracing::{debug, info};

use canopy_core::{RankId, SlotId};

use crate::error::DonationError;
use crate::queue::{PriorityPolicy, QuerySlot, Task, TaskQueue};

#[derive(Debug, Clone)]
pub(crate) struct DonatedQuery {
    pub(crate) query: QuerySlot,
    pub(crate) tasks: Vec<Task>,
}

/// Donor-side record of an exported bundle.
///
/// Exactly one of [`release_cache`](Self::release_cache) or
/// [`reclaim`](Self::reclaim) must be called, and each consumes the record.
#[derive(Debug)]
#[must_use = "a pending donation must be released or reclaimed"]
pub struct PendingDonation {
    source: RankId,
    destination: RankId,
    /// Donor cache slots and how many reference claims the bundle took from each.
    claims: Vec<(SlotId, u32)>,
    queries: Vec<DonatedQuery>,
    points: u64,
}

impl PendingDonation {
    pub(crate) fn new(
        source: RankId,
        destination: RankId,
        claims: Vec<(SlotId, u32)>,
        queries: Vec<DonatedQuery>,
        points: u64,
    ) -> Self {
        Self {
            source,
            destination,
            claims,
            queries,
            points,
        }
    }

    pub fn source(&self) -> RankId {
        self.source
    }

    pub fn destination(&self) -> RankId {
        self.destination
    }

    /// Locked queries awaiting a settlement from the destination.
    pub fn queries(&self) -> Vec<QuerySlot> {
        self.queries.iter().map(|q| q.query).collect()
    }

    /// Points shipped in the bundle.
    pub fn points(&self) -> u64 {
        self.points
    }

    pub fn work(&self) -> u64 {
        self.queries
            .iter()
            .flat_map(|q| q.tasks.iter())
            .map(|t| t.work)
            .sum()
    }

    pub fn claims(&self) -> &[(SlotId, u32)] {
        &self.claims
    }

    /// The destination has the bundle: give back the reference claims the
    /// donated tasks held in the donor's cache, slot by slot and by the count
    /// taken from each. The donated queries stay locked until settled.
    pub fn release_cache<P: PriorityPolicy>(
        self,
        queue: &mut TaskQueue<P>,
    ) -> Result<Vec<QuerySlot>, DonationError> {
        let mut evicted = 0;
        for &(slot, count) in &self.claims {
            if queue.cache_mut().release_references(slot, count)?.is_some() {
                evicted += 1;
            }
        }
        debug!(
            destination = %self.destination,
            slots = self.claims.len(),
            evicted,
            remaining = queue.cache().remaining_budget(),
            "donation claims released"
        );
        Ok(self.queries.into_iter().map(|q| q.query).collect())
    }

    /// The bundle never reached the destination: put every donated task back
    /// on its query, restore the work estimates and unlock the queries.
    pub fn reclaim<P: PriorityPolicy>(self, queue: &mut TaskQueue<P>) -> Result<(), DonationError> {
        let work = self.work();
        for donated in self.queries {
            for task in donated.tasks {
                queue.enqueue(donated.query, task)?;
            }
            queue.unlock(donated.query)?;
        }
        info!(destination = %self.destination, work, "donation reclaimed");
        Ok(())
    }
}
