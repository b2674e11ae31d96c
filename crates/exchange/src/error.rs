use thiserror::Error;

use canopy_core::{FragmentIdentity, PointRange, RankId, SlotId};

use crate::cache::Rejected;
use crate::queue::QuerySlot;
use crate::table::NodeIndex;

/// Shape and structure faults in point tables and tree arenas.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("point ranges must be sorted, non-empty and disjoint: {0:?}")]
    InvalidRanges(Vec<PointRange>),

    #[error("point {0} is not materialized in this block")]
    NotMaterialized(usize),

    #[error("node {0} does not exist")]
    UnknownNode(NodeIndex),

    #[error("node {child} lies outside the span of its parent {parent}")]
    ChildOutsideParent { parent: NodeIndex, child: NodeIndex },

    #[error("node {parent} already has a child in the slot wanted by node {child}")]
    ChildSlotTaken { parent: NodeIndex, child: NodeIndex },
}

/// Violations of the cache's claim bookkeeping. These are logic faults:
/// callers propagate them and treat them as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheFault {
    #[error("fragment {0} is not resident")]
    NotResident(FragmentIdentity),

    #[error("{0} is not resident")]
    UnknownSlot(SlotId),

    #[error("fragment {identity} holds {held} reference claims, cannot release {requested}")]
    ReferenceUnderflow {
        identity: FragmentIdentity,
        held: u32,
        requested: u32,
    },

    #[error("fragment {0} is not held in the query role")]
    NotQuery(FragmentIdentity),
}

/// Errors from task queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("query {0} does not exist")]
    UnknownQuery(QuerySlot),

    #[error("query {query} is locked by {holder}")]
    Locked { query: QuerySlot, holder: RankId },

    #[error("query {0} is not locked")]
    NotLocked(QuerySlot),

    #[error("query {0} still has pending tasks")]
    NotDrained(QuerySlot),

    #[error("fragment {0} already heads a query entry")]
    DuplicateQuery(FragmentIdentity),

    #[error("fragment cache rejected {identity}: needs {required} points, {remaining} remaining")]
    CacheFull {
        identity: FragmentIdentity,
        required: u64,
        remaining: u64,
    },

    #[error(transparent)]
    Cache(#[from] CacheFault),
}

impl From<Rejected> for QueueError {
    fn from(r: Rejected) -> Self {
        QueueError::CacheFull {
            identity: r.identity,
            required: r.required,
            remaining: r.remaining,
        }
    }
}

/// Errors from building, exporting, importing or unwinding a donation.
#[derive(Debug, Error)]
pub enum DonationError {
    #[error("bundle encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("bundle decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("fragment at bundle position {position} is malformed: {reason}")]
    Structure { position: usize, reason: String },

    #[error("bundle addressed to {expected} arrived at {actual}")]
    WrongDestination { expected: RankId, actual: RankId },

    #[error("task list references bundle position {0}, which does not exist")]
    DanglingPosition(usize),

    #[error("fragment at bundle position {position} claims {claimed}, task list implies {implied}")]
    ClaimMismatch {
        position: usize,
        claimed: String,
        implied: String,
    },

    #[error("destination cache cannot hold {identity}: needs {required} points, {remaining} remaining")]
    CapacityExceeded {
        identity: FragmentIdentity,
        required: u64,
        remaining: u64,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheFault),

    #[error(transparent)]
    Table(#[from] TableError),
}
