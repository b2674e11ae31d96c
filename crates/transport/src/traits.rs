use std::sync::Arc;

use async_trait::async_trait;

use canopy_core::RankId;

use crate::error::TransportError;
use crate::message::Message;

/// Reliable, ordered point-to-point delivery to a named rank.
#[async_trait]
pub trait RankSender: Send + Sync {
    async fn send_to(&self, rank: RankId, message: Message) -> Result<(), TransportError>;
}

/// Blanket implementation so `Arc<dyn RankSender>` can be used directly.
#[async_trait]
impl<T: RankSender + ?Sized> RankSender for Arc<T> {
    async fn send_to(&self, rank: RankId, message: Message) -> Result<(), TransportError> {
        (**self).send_to(rank, message).await
    }
}

/// The inbound side of a rank: every message addressed to it, in order.
#[async_trait]
pub trait RankReceiver: Send + Sync {
    /// Receive the next message. Blocks until one is available.
    async fn recv(&self) -> Result<Message, TransportError>;
}
