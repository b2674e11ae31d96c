//! ZeroMQ PUSH/PULL delivery between ranks.
//!
//! Every rank binds one PULL socket on its own endpoint and keeps one PUSH
//! socket connected to each peer's endpoint. A PUSH socket with a single
//! peer preserves send order, which is all the exchange layer asks for.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::{PullSocket, PushSocket, Socket, SocketRecv, SocketSend};

use canopy_core::RankId;

use crate::error::TransportError;
use crate::message::Message;
use crate::traits::{RankReceiver, RankSender};
use crate::transport::Transport;

/// PUSH sockets to every peer rank.
pub struct ZmqRankSender {
    rank: RankId,
    peers: HashMap<RankId, Mutex<PushSocket>>,
}

impl ZmqRankSender {
    /// Connect a PUSH socket to every `(rank, endpoint)` except our own.
    #[instrument(skip_all, fields(rank = %rank, peers = peers.len()))]
    pub async fn connect(rank: RankId, peers: &[(RankId, Transport)]) -> Result<Self, TransportError> {
        let mut sockets = HashMap::with_capacity(peers.len());
        for (peer, transport) in peers {
            if *peer == rank {
                continue;
            }
            let mut socket = PushSocket::new();
            let endpoint = transport.endpoint();
            info!(%peer, endpoint = %endpoint, "connecting PUSH socket");
            socket.connect(&endpoint).await?;
            sockets.insert(*peer, Mutex::new(socket));
        }
        Ok(Self {
            rank,
            peers: sockets,
        })
    }

    pub fn rank(&self) -> RankId {
        self.rank
    }
}

#[async_trait]
impl RankSender for ZmqRankSender {
    async fn send_to(&self, rank: RankId, message: Message) -> Result<(), TransportError> {
        let socket = self.peers.get(&rank).ok_or(TransportError::UnknownRank(rank))?;
        let bytes = message.to_bytes()?;
        let len = bytes.len();
        socket.lock().await.send(bytes.into()).await?;
        debug!(from = %self.rank, to = %rank, topic = %message.topic, bytes = len, "message pushed");
        Ok(())
    }
}

/// PULL socket bound on this rank's own endpoint.
pub struct ZmqRankReceiver {
    socket: Mutex<PullSocket>,
}

impl ZmqRankReceiver {
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, TransportError> {
        transport
            .ensure_ipc_dir()
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        transport
            .remove_stale_socket()
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        let mut socket = PullSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PULL socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl RankReceiver for ZmqRankReceiver {
    async fn recv(&self) -> Result<Message, TransportError> {
        let mut socket = self.socket.lock().await;
        let raw = socket.recv().await?;
        let bytes = raw
            .get(0)
            .ok_or_else(|| TransportError::Transport("empty ZMQ frame".into()))?;
        Ok(Message::from_bytes(bytes.as_ref())?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messages::{topics, WorkRequest};

    #[tokio::test]
    async fn push_pull_between_two_ranks() {
        let inbound = Transport::tcp("127.0.0.1", 15710);
        let receiver = ZmqRankReceiver::bind(&inbound).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let peers = vec![(RankId(0), Transport::tcp("127.0.0.1", 15711)), (RankId(1), inbound)];
        let sender = ZmqRankSender::connect(RankId(0), &peers).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        for budget in [10u64, 20, 30] {
            let req = WorkRequest { from: RankId(0), budget };
            let msg = Message::new(topics::WORK_REQUEST, RankId(0), &req).unwrap();
            sender.send_to(RankId(1), msg).await.unwrap();
        }

        for expected in [10u64, 20, 30] {
            let msg = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
                .await
                .expect("message should arrive")
                .unwrap();
            assert_eq!(msg.source, RankId(0));
            assert_eq!(msg.decode::<WorkRequest>().unwrap().budget, expected, "order preserved");
        }
    }

    #[tokio::test]
    async fn sending_to_unknown_rank_fails() {
        let sender = ZmqRankSender::connect(RankId(0), &[]).await.unwrap();
        let msg = Message::raw(topics::SHUTDOWN, RankId(0), vec![]);
        assert!(matches!(
            sender.send_to(RankId(9), msg).await,
            Err(TransportError::UnknownRank(RankId(9)))
        ));
    }
}
