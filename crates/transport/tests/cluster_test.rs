//! Every rank of a small TCP cluster can reach every other rank.

use std::time::Duration;

use canopy_core::RankId;
use canopy_transport::{
    topics, ClusterConfig, Message, RankReceiver, RankSender, WorkRequest, ZmqRankReceiver,
    ZmqRankSender,
};

const CLUSTER: &str = r#"
[transport]
kind = "tcp"
base_port = 15800

[[ranks]]
id = 0
[[ranks]]
id = 1
[[ranks]]
id = 2
"#;

#[tokio::test]
async fn all_pairs_exchange_messages() {
    let config = ClusterConfig::from_toml(CLUSTER).unwrap();
    let peers = config.peers().unwrap();

    let mut receivers = Vec::new();
    for (_, transport) in &peers {
        receivers.push(ZmqRankReceiver::bind(transport).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut senders = Vec::new();
    for (rank, _) in &peers {
        senders.push(ZmqRankSender::connect(*rank, &peers).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (from, sender) in senders.iter().enumerate() {
        for to in 0..peers.len() {
            if to == from {
                continue;
            }
            let req = WorkRequest { from: RankId(from as u32), budget: 100 * from as u64 };
            let msg = Message::new(topics::WORK_REQUEST, RankId(from as u32), &req).unwrap();
            sender.send_to(RankId(to as u32), msg).await.unwrap();
        }
    }

    for (to, receiver) in receivers.iter().enumerate() {
        let mut sources = Vec::new();
        for _ in 0..peers.len() - 1 {
            let msg = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
                .await
                .expect("message should arrive")
                .unwrap();
            let req: WorkRequest = msg.decode().unwrap();
            assert_eq!(req.from, msg.source);
            sources.push(req.from.0);
        }
        sources.sort_unstable();
        let expected: Vec<u32> = (0..peers.len() as u32).filter(|&r| r != to as u32).collect();
        assert_eq!(sources, expected, "rank {to} should hear from every peer");
    }
}
