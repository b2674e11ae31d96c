//! Identity-keyed fragment cache with role bookkeeping and a point budget.
//!
//! Every resident fragment sits in exactly one slot. A slot stays resident
//! while its fragment plays the query role of some task list or is referenced
//! by at least one pending task; the moment both claims are gone the slot is
//! evicted and its points return to the admission budget.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use canopy_core::{FragmentIdentity, SlotId};

use crate::error::CacheFault;
use crate::fragment::SubTreeFragment;

/// Claims held on a resident fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    QueryOnly,
    ReferenceOnly(u32),
    Both(u32),
}

impl Role {
    pub fn is_query(self) -> bool {
        matches!(self, Role::QueryOnly | Role::Both(_))
    }

    pub fn reference_count(self) -> u32 {
        match self {
            Role::ReferenceOnly(n) | Role::Both(n) => n,
            Role::Idle | Role::QueryOnly => 0,
        }
    }

    pub fn is_retained(self) -> bool {
        self != Role::Idle
    }

    fn claim(self, as_query: bool) -> Role {
        match (self, as_query) {
            (Role::Idle, true) | (Role::QueryOnly, true) => Role::QueryOnly,
            (Role::ReferenceOnly(n), true) | (Role::Both(n), true) => Role::Both(n),
            (Role::Idle, false) => Role::ReferenceOnly(1),
            (Role::QueryOnly, false) => Role::Both(1),
            (Role::ReferenceOnly(n), false) => Role::ReferenceOnly(n + 1),
            (Role::Both(n), false) => Role::Both(n + 1),
        }
    }

    fn release_query(self, identity: FragmentIdentity) -> Result<Role, CacheFault> {
        match self {
            Role::QueryOnly => Ok(Role::Idle),
            Role::Both(n) => Ok(Role::ReferenceOnly(n)),
            Role::Idle | Role::ReferenceOnly(_) => Err(CacheFault::NotQuery(identity)),
        }
    }

    fn release_references(self, count: u32, identity: FragmentIdentity) -> Result<Role, CacheFault> {
        let held = self.reference_count();
        if count > held {
            return Err(CacheFault::ReferenceUnderflow {
                identity,
                held,
                requested: count,
            });
        }
        Ok(match (self, held - count) {
            (Role::Both(_), 0) => Role::QueryOnly,
            (Role::Both(_), n) => Role::Both(n),
            (Role::ReferenceOnly(_), 0) => Role::Idle,
            (Role::ReferenceOnly(_), n) => Role::ReferenceOnly(n),
            (role, _) => role,
        })
    }
}

/// Admission refused: the fragment does not fit in the remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub identity: FragmentIdentity,
    pub required: u64,
    pub remaining: u64,
}

/// A resident fragment and the claims on it.
#[derive(Debug, Clone)]
pub struct CachedFragment {
    fragment: SubTreeFragment,
    role: Role,
}

impl CachedFragment {
    pub fn fragment(&self) -> &SubTreeFragment {
        &self.fragment
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> FragmentIdentity {
        self.fragment.identity()
    }
}

#[derive(Debug)]
pub struct FragmentCache {
    slots: BTreeMap<SlotId, CachedFragment>,
    index: HashMap<FragmentIdentity, SlotId>,
    next_slot: u64,
    capacity: u64,
    remaining: u64,
}

impl FragmentCache {
    /// Create a cache that admits at most `capacity` points at once.
    pub fn new(capacity: u64) -> Self {
        Self {
            slots: BTreeMap::new(),
            index: HashMap::new(),
            next_slot: 0,
            capacity,
            remaining: capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(u64::MAX)
    }

    /// Admit `fragment` in the query or reference role.
    ///
    /// A fragment whose identity is already resident is never charged again:
    /// a query admission marks the slot as a query and swaps in the incoming
    /// handle (a later copy may carry more materialized points), a reference
    /// admission bumps the reference count. A new identity is admitted only if
    /// its point count fits the remaining budget; otherwise nothing changes.
    pub fn admit(&mut self, fragment: SubTreeFragment, as_query: bool) -> Result<SlotId, Rejected> {
        let identity = fragment.identity();

        if let Some(&slot) = self.index.get(&identity) {
            if let Some(entry) = self.slots.get_mut(&slot) {
                entry.role = entry.role.claim(as_query);
                if as_query {
                    entry.fragment = fragment;
                }
                debug!(%identity, %slot, as_query, role = ?entry.role, "fragment already resident");
                return Ok(slot);
            }
        }

        let required = fragment.point_count();
        if required > self.remaining {
            debug!(%identity, required, remaining = self.remaining, "fragment does not fit");
            return Err(Rejected {
                identity,
                required,
                remaining: self.remaining,
            });
        }

        let slot = SlotId(self.next_slot);
        self.next_slot += 1;
        self.remaining -= required;
        self.index.insert(identity, slot);
        self.slots.insert(
            slot,
            CachedFragment {
                fragment,
                role: Role::Idle.claim(as_query),
            },
        );
        debug!(%identity, %slot, as_query, remaining = self.remaining, "fragment admitted");
        Ok(slot)
    }

    /// Add one more claim to a resident slot without supplying a handle.
    pub fn retain(&mut self, slot: SlotId, as_query: bool) -> Result<(), CacheFault> {
        let entry = self.slots.get_mut(&slot).ok_or(CacheFault::UnknownSlot(slot))?;
        entry.role = entry.role.claim(as_query);
        Ok(())
    }

    /// Drop one claim on `identity`. Returns the fragment if this evicted it.
    pub fn release(
        &mut self,
        identity: FragmentIdentity,
        as_query: bool,
    ) -> Result<Option<SubTreeFragment>, CacheFault> {
        let slot = self.find(identity).ok_or(CacheFault::NotResident(identity))?;
        self.release_slot(slot, as_query)
    }

    /// Drop one claim on `slot`. Returns the fragment if this evicted it.
    pub fn release_slot(
        &mut self,
        slot: SlotId,
        as_query: bool,
    ) -> Result<Option<SubTreeFragment>, CacheFault> {
        if as_query {
            self.transition(slot, |role, identity| role.release_query(identity))
        } else {
            self.transition(slot, |role, identity| role.release_references(1, identity))
        }
    }

    /// Drop `count` reference claims on `slot` at once.
    pub fn release_references(
        &mut self,
        slot: SlotId,
        count: u32,
    ) -> Result<Option<SubTreeFragment>, CacheFault> {
        self.transition(slot, |role, identity| role.release_references(count, identity))
    }

    fn transition(
        &mut self,
        slot: SlotId,
        step: impl FnOnce(Role, FragmentIdentity) -> Result<Role, CacheFault>,
    ) -> Result<Option<SubTreeFragment>, CacheFault> {
        let entry = self.slots.get_mut(&slot).ok_or(CacheFault::UnknownSlot(slot))?;
        let identity = entry.identity();
        entry.role = step(entry.role, identity)?;
        if entry.role.is_retained() {
            return Ok(None);
        }
        Ok(self.evict(slot))
    }

    fn evict(&mut self, slot: SlotId) -> Option<SubTreeFragment> {
        let entry = self.slots.remove(&slot)?;
        let identity = entry.identity();
        self.index.remove(&identity);
        self.remaining += entry.fragment.point_count();
        debug!(%identity, %slot, remaining = self.remaining, "fragment evicted");
        Some(entry.fragment)
    }

    pub fn find(&self, identity: FragmentIdentity) -> Option<SlotId> {
        self.index.get(&identity).copied()
    }

    pub fn get(&self, slot: SlotId) -> Option<&CachedFragment> {
        self.slots.get(&slot)
    }

    pub fn fragment(&self, slot: SlotId) -> Option<&SubTreeFragment> {
        self.slots.get(&slot).map(|e| &e.fragment)
    }

    pub fn role(&self, slot: SlotId) -> Option<Role> {
        self.slots.get(&slot).map(|e| e.role)
    }

    /// Resident slots in admission order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &CachedFragment)> {
        self.slots.iter().map(|(slot, entry)| (*slot, entry))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining_budget(&self) -> u64 {
        self.remaining
    }

    /// Sum of point counts over resident fragments.
    pub fn resident_points(&self) -> u64 {
        self.slots.values().map(|e| e.fragment.point_count()).sum()
    }

    /// Dump the identity-to-slot mapping at debug level.
    pub fn log_contents(&self) {
        for (slot, entry) in &self.slots {
            debug!(
                identity = %entry.identity(),
                %slot,
                role = ?entry.role,
                borrowed = entry.fragment.is_borrowed(),
                "cache slot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use canopy_core::{PointRange, RankId};

    use super::*;
    use crate::table::PointTable;

    /// A 64-point table; returns it together with fragments of 32, 16 and 8 points.
    fn fixture() -> (Arc<PointTable>, Vec<SubTreeFragment>) {
        let points: Vec<f64> = (0..64).map(|i| i as f64).collect();
        let table = Arc::new(PointTable::build(RankId(0), 1, points, 0, vec![], 1).unwrap());
        let mut frags = Vec::new();
        let mut node = table.root();
        for _ in 0..4 {
            frags.push(SubTreeFragment::borrowed(Arc::clone(&table), node).unwrap());
            node = table.node(node).unwrap().left.unwrap();
        }
        (table, frags)
    }

    fn assert_budget(cache: &FragmentCache) {
        assert_eq!(
            cache.remaining_budget() + cache.resident_points(),
            cache.capacity(),
            "budget invariant violated"
        );
    }

    #[test]
    fn role_transitions() {
        let id = FragmentIdentity::new(RankId(0), 0, 1);
        let role = Role::Idle.claim(false).claim(true).claim(false);
        assert_eq!(role, Role::Both(2));
        assert_eq!(role.release_query(id), Ok(Role::ReferenceOnly(2)));
        assert_eq!(role.release_references(2, id), Ok(Role::QueryOnly));
        assert_eq!(Role::ReferenceOnly(1).release_references(1, id), Ok(Role::Idle));
        assert_eq!(Role::ReferenceOnly(1).release_query(id), Err(CacheFault::NotQuery(id)));
        assert!(matches!(
            Role::QueryOnly.release_references(1, id),
            Err(CacheFault::ReferenceUnderflow { held: 0, requested: 1, .. })
        ));
    }

    #[test]
    fn admission_charges_budget_once() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(40);

        let q = cache.admit(frags[1].clone(), true).unwrap();
        assert_eq!(cache.remaining_budget(), 8);
        let again = cache.admit(frags[1].clone(), false).unwrap();
        assert_eq!(q, again);
        assert_eq!(cache.remaining_budget(), 8, "resident identity must not be charged again");
        assert_eq!(cache.role(q), Some(Role::Both(1)));
        assert_budget(&cache);
    }

    #[test]
    fn rejection_leaves_state_untouched() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(20);
        cache.admit(frags[2].clone(), false).unwrap();

        let err = cache.admit(frags[0].clone(), true).unwrap_err();
        assert_eq!(err.required, 64);
        assert_eq!(err.remaining, 4);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remaining_budget(), 4);
        assert!(cache.find(frags[0].identity()).is_none());
    }

    #[test]
    fn eviction_returns_points_when_claims_drop_to_zero() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(64);
        let slot = cache.admit(frags[2].clone(), false).unwrap();
        cache.admit(frags[2].clone(), false).unwrap();
        cache.admit(frags[2].clone(), true).unwrap();

        assert!(cache.release(frags[2].identity(), false).unwrap().is_none());
        assert!(cache.release(frags[2].identity(), true).unwrap().is_none());
        let evicted = cache.release_slot(slot, false).unwrap();
        assert!(evicted.is_some());
        assert!(cache.is_empty());
        assert_eq!(cache.remaining_budget(), 64);
    }

    #[test]
    fn over_release_is_a_fault() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(64);
        let slot = cache.admit(frags[3].clone(), false).unwrap();
        assert!(matches!(
            cache.release_references(slot, 2),
            Err(CacheFault::ReferenceUnderflow { held: 1, requested: 2, .. })
        ));
        assert_eq!(cache.role(slot), Some(Role::ReferenceOnly(1)), "failed release must not mutate");
        assert!(matches!(
            cache.release(frags[0].identity(), false),
            Err(CacheFault::NotResident(id)) if id == frags[0].identity()
        ));
    }

    #[test]
    fn query_readmission_swaps_in_richer_handle() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(64);
        let sparse = frags[1].clone().with_ranges(vec![PointRange::new(0, 4)]).unwrap();
        let slot = cache.admit(sparse, false).unwrap();
        assert_eq!(cache.fragment(slot).unwrap().materialized_points(), 4);

        let again = cache.admit(frags[1].clone(), true).unwrap();
        assert_eq!(slot, again);
        assert_eq!(cache.fragment(slot).unwrap().materialized_points(), 32);
        assert_eq!(cache.remaining_budget(), 32);
        assert_eq!(cache.role(slot), Some(Role::Both(1)));
    }

    #[test]
    fn budget_and_identity_invariants_hold_over_mixed_sequence() {
        let (_t, frags) = fixture();
        let mut cache = FragmentCache::new(48);
        let ops: &[(usize, bool, bool)] = &[
            // (fragment, as_query, is_release)
            (1, true, false),
            (2, false, false),
            (3, false, false),
            (0, false, false),
            (2, false, false),
            (1, false, false),
            (2, false, true),
            (1, true, true),
            (2, false, true),
            (3, false, false),
            (1, false, true),
            (3, false, true),
            (2, true, false),
        ];
        for &(i, as_query, is_release) in ops {
            if is_release {
                cache.release(frags[i].identity(), as_query).unwrap();
            } else {
                let _ = cache.admit(frags[i].clone(), as_query);
            }
            assert_budget(&cache);
            let ids: HashSet<_> = cache.iter().map(|(_, e)| e.identity()).collect();
            assert_eq!(ids.len(), cache.len(), "duplicate identity resident");
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.find(frags[2].identity()).is_some());
        assert_eq!(cache.remaining_budget(), 32);
    }
}
