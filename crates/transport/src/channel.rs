//! In-process delivery over tokio channels, for running a whole world of
//! ranks inside one process (simulation and tests).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use canopy_core::RankId;

use crate::error::TransportError;
use crate::message::Message;
use crate::traits::{RankReceiver, RankSender};

/// Routes to every rank's inbox. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    inboxes: Arc<HashMap<RankId, mpsc::UnboundedSender<Message>>>,
}

pub struct ChannelReceiver {
    rank: RankId,
    inbox: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl ChannelReceiver {
    pub fn rank(&self) -> RankId {
        self.rank
    }
}

/// Build inboxes for ranks `0..world_size`. Receivers come back in rank order.
pub fn channel_network(world_size: u32) -> (ChannelSender, Vec<ChannelReceiver>) {
    let mut inboxes = HashMap::with_capacity(world_size as usize);
    let mut receivers = Vec::with_capacity(world_size as usize);
    for r in 0..world_size {
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(RankId(r), tx);
        receivers.push(ChannelReceiver {
            rank: RankId(r),
            inbox: Mutex::new(rx),
        });
    }
    (
        ChannelSender {
            inboxes: Arc::new(inboxes),
        },
        receivers,
    )
}

#[async_trait]
impl RankSender for ChannelSender {
    async fn send_to(&self, rank: RankId, message: Message) -> Result<(), TransportError> {
        let inbox = self.inboxes.get(&rank).ok_or(TransportError::UnknownRank(rank))?;
        debug!(from = %message.source, to = %rank, topic = %message.topic, "message queued");
        inbox.send(message).map_err(|_| TransportError::Closed(rank))
    }
}

#[async_trait]
impl RankReceiver for ChannelReceiver {
    async fn recv(&self) -> Result<Message, TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed(self.rank))
    }
}
