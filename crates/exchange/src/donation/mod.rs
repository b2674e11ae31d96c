//! Donating work to another rank.
//!
//! The donor builds a [`DonationBundle`] against its [`TaskQueue`](crate::queue::TaskQueue),
//! exports it to bytes plus a [`PendingDonation`], and once the transport has
//! taken the bytes either releases the donor-side claims or reclaims the work.
//! The receiver hands the bytes to [`import_donation`].

mod builder;
mod import;
mod pending;
pub mod wire;

pub use builder::{BuildOutcome, DonationBundle};
pub use import::{import_donation, ImportedDonation};
pub use pending::PendingDonation;
