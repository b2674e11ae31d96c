//! Rank-to-rank messaging: the envelope, point-to-point delivery traits and
//! their ZeroMQ and in-process implementations, and cluster configuration.

pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod messages;
pub mod traits;
pub mod transport;
pub mod zmq;

pub use channel::{channel_network, ChannelReceiver, ChannelSender};
pub use config::{ClusterConfig, RankEntry, TransportConfig};
pub use error::TransportError;
pub use message::{Message, ENVELOPE_VERSION};
pub use messages::{topics, DonationReceipt, DonationSettled, WorkRequest};
pub use traits::{RankReceiver, RankSender};
pub use transport::Transport;
pub use zmq::{ZmqRankReceiver, ZmqRankSender};
