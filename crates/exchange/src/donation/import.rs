use std::collections::HashSet;

use tracing::{info, warn};

use canopy_core::{RankId, SlotId};

use crate::cache::FragmentCache;
use crate::error::{CacheFault, DonationError, QueueError};
use crate::fragment::SubTreeFragment;
use crate::queue::{PriorityPolicy, QuerySlot, Task, TaskQueue};

use super::wire::WireBundle;

/// What an import added to the destination queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedDonation {
    pub source: RankId,
    /// New query entries, in bundle order, each tagged with `source` as origin.
    pub queries: Vec<QuerySlot>,
    pub fragments: usize,
    pub points: u64,
    pub work: u64,
}

/// Claims one bundle position holds in the destination cache.
struct Admitted {
    slot: SlotId,
    as_query: bool,
    references: u32,
}

/// Materialize a bundle into `queue`.
///
/// Either the whole bundle is wired in, or the queue and its cache are left
/// as they were: every structural check runs before the cache is touched,
/// and a fragment the cache cannot hold rolls back the ones admitted before it.
pub fn import_donation<P: PriorityPolicy>(
    queue: &mut TaskQueue<P>,
    bytes: &[u8],
) -> Result<ImportedDonation, DonationError> {
    let wire = WireBundle::decode(bytes)?;
    if wire.destination != queue.rank() {
        return Err(DonationError::WrongDestination {
            expected: wire.destination,
            actual: queue.rank(),
        });
    }
    check_claims(&wire)?;

    let source = wire.source;
    let claims: Vec<(bool, u32)> = wire
        .fragments
        .iter()
        .map(|f| (f.as_query, f.reference_count))
        .collect();
    let fragments = wire
        .fragments
        .into_iter()
        .enumerate()
        .map(|(position, f)| f.materialize(position))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::with_capacity(fragments.len());
    for (position, fragment) in fragments.iter().enumerate() {
        if !seen.insert(fragment.identity()) {
            return Err(DonationError::Structure {
                position,
                reason: format!("fragment {} appears twice in the bundle", fragment.identity()),
            });
        }
    }
    for list in &wire.tasks {
        let identity = fragments[list.query as usize].identity();
        if queue.find_query(identity).is_some() {
            return Err(QueueError::DuplicateQuery(identity).into());
        }
    }

    let points: u64 = fragments.iter().map(|f| f.point_count()).sum();
    let fragment_count = fragments.len();
    let admitted = admit_all(queue.cache_mut(), fragments, &claims)?;

    let mut queries = Vec::with_capacity(wire.tasks.len());
    let mut work = 0u64;
    for list in &wire.tasks {
        let query = &admitted[list.query as usize];
        let identity = queue
            .cache()
            .get(query.slot)
            .map(|e| e.identity())
            .ok_or(CacheFault::UnknownSlot(query.slot))?;
        let slot = queue.open_entry(identity, query.slot, source)?;
        for reference in &list.references {
            let target = &admitted[reference.position as usize];
            let reference_identity = queue
                .cache()
                .get(target.slot)
                .map(|e| e.identity())
                .ok_or(CacheFault::UnknownSlot(target.slot))?;
            queue.enqueue(
                slot,
                Task {
                    reference: reference_identity,
                    reference_slot: target.slot,
                    work: reference.work,
                },
            )?;
            work += reference.work;
        }
        queries.push(slot);
    }

    info!(
        %source,
        destination = %queue.rank(),
        queries = queries.len(),
        fragments = fragment_count,
        points,
        work,
        "donation imported"
    );
    Ok(ImportedDonation {
        source,
        queries,
        fragments: fragment_count,
        points,
        work,
    })
}

/// Every position named by a task list exists, and the claims each fragment
/// was packed with are exactly the ones the task lists imply.
fn check_claims(wire: &WireBundle) -> Result<(), DonationError> {
    let n = wire.fragments.len();
    let mut implied = vec![(false, 0u32); n];
    for list in &wire.tasks {
        let q = list.query as usize;
        if q >= n {
            return Err(DonationError::DanglingPosition(q));
        }
        if implied[q].0 {
            return Err(DonationError::Structure {
                position: q,
                reason: "fragment heads two task lists".into(),
            });
        }
        if list.references.is_empty() {
            return Err(DonationError::Structure {
                position: q,
                reason: "query arrived without any reference tasks".into(),
            });
        }
        implied[q].0 = true;
        for reference in &list.references {
            let r = reference.position as usize;
            if r >= n {
                return Err(DonationError::DanglingPosition(r));
            }
            implied[r].1 += 1;
        }
    }

    for (position, (fragment, implied)) in wire.fragments.iter().zip(implied).enumerate() {
        let claimed = (fragment.as_query, fragment.reference_count);
        if claimed != implied {
            return Err(DonationError::ClaimMismatch {
                position,
                claimed: describe(claimed),
                implied: describe(implied),
            });
        }
        if claimed == (false, 0) {
            return Err(DonationError::Structure {
                position,
                reason: "fragment is not used by any task".into(),
            });
        }
    }
    Ok(())
}

fn describe((as_query, references): (bool, u32)) -> String {
    format!("query={as_query} references={references}")
}

fn admit_all(
    cache: &mut FragmentCache,
    fragments: Vec<SubTreeFragment>,
    claims: &[(bool, u32)],
) -> Result<Vec<Admitted>, DonationError> {
    let mut admitted: Vec<Admitted> = Vec::with_capacity(fragments.len());
    for (fragment, &(as_query, references)) in fragments.into_iter().zip(claims) {
        let slot = match cache.admit(fragment, as_query) {
            Ok(slot) => slot,
            Err(rejected) => {
                warn!(
                    identity = %rejected.identity,
                    required = rejected.required,
                    remaining = rejected.remaining,
                    admitted = admitted.len(),
                    "destination cache full, rolling back import"
                );
                roll_back(cache, &admitted);
                return Err(DonationError::CapacityExceeded {
                    identity: rejected.identity,
                    required: rejected.required,
                    remaining: rejected.remaining,
                });
            }
        };
        // The admission itself took one reference claim when not a query.
        let extra = if as_query { references } else { references.saturating_sub(1) };
        for _ in 0..extra {
            cache.retain(slot, false)?;
        }
        admitted.push(Admitted {
            slot,
            as_query,
            references,
        });
    }
    Ok(admitted)
}

fn roll_back(cache: &mut FragmentCache, admitted: &[Admitted]) {
    for a in admitted.iter().rev() {
        if a.references > 0 {
            if let Err(fault) = cache.release_references(a.slot, a.references) {
                warn!(slot = %a.slot, %fault, "rollback failed to release reference claims");
            }
        }
        if a.as_query {
            if let Err(fault) = cache.release_slot(a.slot, true) {
                warn!(slot = %a.slot, %fault, "rollback failed to release query claim");
            }
        }
    }
}
