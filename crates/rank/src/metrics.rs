use chrono::{DateTime, Utc};
use serde::Serialize;

use canopy_exchange::ImportedDonation;

/// Donation traffic of one rank, exposed to dashboards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeMetrics {
    /// Bundles handed to the transport.
    pub donations_sent: u64,
    /// Bundles imported from peers.
    pub donations_received: u64,
    /// Candidate queries offered to a bundle that ended up void.
    pub void_attempts: u64,
    /// Candidate queries too large for what was left of the budget.
    pub rejected_queries: u64,
    pub points_shipped: u64,
    pub points_received: u64,
    pub work_donated: u64,
    pub work_received: u64,
    /// Bundles from peers that failed to import.
    pub aborted_imports: u64,
    /// Donations taken back after a failed send or a refused import.
    pub reclaimed: u64,
    pub settlements_sent: u64,
    pub settlements_received: u64,
    /// Envelopes dropped for carrying another schema version.
    pub ignored_messages: u64,
    /// Work visited locally through the engine hook.
    pub work_visited: u64,
    pub last_donation: Option<DateTime<Utc>>,
}

impl ExchangeMetrics {
    pub fn record_sent(&mut self, points: u64, work: u64) {
        self.donations_sent += 1;
        self.points_shipped += points;
        self.work_donated += work;
        self.last_donation = Some(Utc::now());
    }

    pub fn record_received(&mut self, imported: &ImportedDonation) {
        self.donations_received += 1;
        self.points_received += imported.points;
        self.work_received += imported.work;
    }

    /// Work this rank handed off and never took back.
    pub fn net_work_donated(&self) -> i128 {
        self.work_donated as i128 - self.work_received as i128
    }
}
