//! Topics and payloads exchanged between ranks.

use serde::{Deserialize, Serialize};

use canopy_core::{FragmentIdentity, RankId};

pub mod topics {
    //! Topics follow `canopy.<domain>.<event>`.

    /// Encoded donation bundle; the payload is the bundle bytes as is.
    pub const DONATION_BUNDLE: &str = "canopy.donation.bundle";

    /// Receiver's answer to a bundle: imported or refused.
    pub const DONATION_RECEIPT: &str = "canopy.donation.receipt";

    /// A donated query has no more work on the receiving rank.
    pub const DONATION_SETTLED: &str = "canopy.donation.settled";

    /// A rank running low on work asks a peer for a donation.
    pub const WORK_REQUEST: &str = "canopy.work.request";

    pub const SHUTDOWN: &str = "canopy.control.shutdown";
}

/// Sent back for every bundle, correlated with the bundle message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationReceipt {
    pub from: RankId,
    pub accepted: bool,
    /// Why the import was aborted, when it was.
    pub reason: Option<String>,
}

/// Completion signal for one donated query, sent to the rank that locked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationSettled {
    pub from: RankId,
    pub query: FragmentIdentity,
}

/// Request for up to `budget` points of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub from: RankId,
    pub budget: u64,
}
