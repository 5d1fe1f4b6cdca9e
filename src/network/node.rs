use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ChannelTransport, Envelope, Transport};
use crate::common::{Config, ConfigError, Crypto, Ed25519Crypto, Keypair, ProcessId, Unverified};
use crate::consensus::engine::ConsensusEngine;
use crate::consensus::message::{Rank, Value};
use crate::consensus::peers::Peers;
use crate::consensus::processor::ConsensusProcessor;

/// A running process: its processor task and the handles to watch it.
pub struct Node {
    pub id: ProcessId,
    decision_rx: watch::Receiver<Option<(Rank, Value)>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Node {
    pub fn spawn<T: Transport>(
        engine: ConsensusEngine,
        transport: T,
        inbox: UnboundedReceiver<Envelope>,
    ) -> Self {
        let id = engine.id();
        let (decision_tx, decision_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = ConsensusProcessor::new(engine, transport, inbox, decision_tx, shutdown_rx);

        Node {
            id,
            decision_rx,
            shutdown_tx,
            handle: tokio::spawn(processor.run()),
        }
    }

    pub fn decision(&self) -> Option<(Rank, Value)> {
        self.decision_rx.borrow().clone()
    }

    /// Waits until the process decides. `None` if it stopped first.
    pub async fn decided(&mut self) -> Option<(Rank, Value)> {
        self.decision_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|decision| decision.clone())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Spawns one node per input over an in-process channel mesh.
///
/// With `signed` set every process gets a deterministic ed25519 key and
/// checks response signatures against the others' keys.
pub fn spawn_cluster(
    config: &Config,
    inputs: Vec<Value>,
    signed: bool,
) -> Result<Vec<Node>, ConfigError> {
    if inputs.len() != config.n {
        return Err(ConfigError::InputCount {
            expected: config.n,
            actual: inputs.len(),
        });
    }

    let seed = |id: ProcessId| {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&id.to_be_bytes());
        seed
    };
    let peers = Peers::for_config(
        config,
        config
            .members()
            .map(|id| Keypair::from_seed(seed(id)).pubkey())
            .collect(),
    )?;

    let (transports, inboxes) = ChannelTransport::mesh(config.n);
    let mut nodes = Vec::with_capacity(config.n);
    for ((transport, inbox), input) in transports.into_iter().zip(inboxes).zip(inputs) {
        let id = transport.id();
        let crypto: Arc<dyn Crypto> = if signed {
            Arc::new(Ed25519Crypto::new(id, Keypair::from_seed(seed(id)), peers.clone()))
        } else {
            Arc::new(Unverified::new(id))
        };
        let engine = ConsensusEngine::new(id, config.clone(), crypto, input)?;
        nodes.push(Node::spawn(engine, transport, inbox));
    }
    Ok(nodes)
}
