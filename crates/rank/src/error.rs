use thiserror::Error;

use canopy_exchange::{DonationError, QueueError};
use canopy_transport::TransportError;

/// Errors surfaced by a rank's exchange loop.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Donation(#[from] DonationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("payload encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
