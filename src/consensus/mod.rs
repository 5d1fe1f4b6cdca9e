pub mod engine;
pub mod message;
pub mod peers;
pub mod preconsensus;
pub mod processor;
pub mod qc;
pub mod quorum;
pub mod register;
pub mod store;

pub use engine::*;
pub use message::*;
pub use peers::*;
pub use preconsensus::*;
pub use processor::*;
pub use qc::*;
pub use quorum::*;
pub use register::*;
pub use store::*;

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::common::{Config, Unverified};
    use crate::network::{ChannelTransport, Node};

    #[tokio::test]
    async fn test_end_to_end() {
        let config = Config::for_faults(1);
        let (transports, inboxes) = ChannelTransport::mesh(config.n);
        let inputs = [30u64, 10, 30, 20];

        let mut nodes: Vec<Node> = transports
            .into_iter()
            .zip(inboxes)
            .zip(inputs)
            .map(|((transport, inbox), input)| {
                let id = transport.id();
                let engine = ConsensusEngine::new(
                    id,
                    config.clone(),
                    Arc::new(Unverified::new(id)),
                    Value::from(input),
                )
                .unwrap();
                Node::spawn(engine, transport, inbox)
            })
            .collect();

        let mut decided = BTreeMap::new();
        for node in nodes.iter_mut() {
            let decision = timeout(Duration::from_secs(30), node.decided())
                .await
                .unwrap()
                .unwrap();
            decided.insert(node.id, decision);
        }

        let first = decided[&0].1.clone();
        for (_, value) in decided.values() {
            assert_eq!(value, &first);
        }
        assert!(inputs.iter().any(|input| Value::from(*input) == first));

        for node in nodes {
            node.shutdown().await;
        }
    }
}
