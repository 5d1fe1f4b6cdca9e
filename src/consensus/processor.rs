use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::engine::{Action, ConsensusEngine};
use super::message::{Rank, Value};
use crate::common::Rejection;
use crate::network::{Envelope, Transport};

/// Drives one engine from its inbox and carries out what it asks for.
///
/// The processor is where the link's idea of the sender meets the sender a
/// message claims: the two must agree before the engine sees it.
pub struct ConsensusProcessor<T: Transport> {
    engine: ConsensusEngine,
    transport: T,
    inbox: UnboundedReceiver<Envelope>,
    decision_tx: watch::Sender<Option<(Rank, Value)>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport> ConsensusProcessor<T> {
    pub fn new(
        engine: ConsensusEngine,
        transport: T,
        inbox: UnboundedReceiver<Envelope>,
        decision_tx: watch::Sender<Option<(Rank, Value)>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        ConsensusProcessor {
            engine,
            transport,
            inbox,
            decision_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(
            process = self.engine.id(),
            input = %self.engine.input(),
            "running consensus processor"
        );
        let actions = self.engine.start();
        self.execute(actions);

        loop {
            tokio::select! {
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                _ = self.shutdown_rx.changed() => break,
            }
        }
        debug!(
            process = self.engine.id(),
            rank = self.engine.rank(),
            "consensus processor stopped"
        );
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        if let Err(rejection) = Self::authenticate(&envelope) {
            warn!(process = self.engine.id(), %rejection, "dropping impersonated message");
            return;
        }
        let actions = self.engine.handle(envelope.message);
        self.execute(actions);
    }

    fn authenticate(envelope: &Envelope) -> Result<(), Rejection> {
        let claimed = envelope.message.sender();
        if claimed != envelope.from {
            return Err(Rejection::UnverifiedSender {
                claimed,
                actual: envelope.from,
            });
        }
        Ok(())
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BroadcastToAll(message) => {
                    if let Err(error) = self.transport.broadcast_to_all(message) {
                        debug!(process = self.engine.id(), %error, "broadcast incomplete");
                    }
                }
                Action::Decided { rank, value } => {
                    info!(process = self.engine.id(), rank, %value, "decision reached");
                    self.decision_tx.send_replace(Some((rank, value)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::common::{Config, Unverified};
    use crate::consensus::message::{Broadcast, Message, Proposal};
    use crate::network::ChannelTransport;

    #[tokio::test]
    async fn test_drops_impersonated_messages() {
        let (mut transports, mut inboxes) = ChannelTransport::mesh(4);
        let transport = transports.remove(0);
        let (tx, rx) = unbounded_channel();
        let (decision_tx, _decision_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = ConsensusEngine::new(
            0,
            Config::for_faults(1),
            Arc::new(Unverified::new(0)),
            Value::from(1),
        )
        .unwrap();
        let processor = ConsensusProcessor::new(engine, transport, rx, decision_tx, shutdown_rx);
        let handle = tokio::spawn(processor.run());

        // Its own rank 0 broadcast shows up in every inbox.
        let own = inboxes[1].recv().await.unwrap();
        assert_eq!(own.from, 0);

        let forged = Message::Broadcast(Arc::new(Broadcast::new(
            0,
            2,
            Proposal::R(Value::from(9)),
            vec![],
        )));
        tx.send(Envelope {
            from: 3,
            message: forged.clone(),
        })
        .unwrap();
        tx.send(Envelope {
            from: 2,
            message: forged,
        })
        .unwrap();

        // Only the authentic copy is answered.
        let answer = timeout(Duration::from_secs(5), inboxes[1].recv())
            .await
            .unwrap()
            .unwrap();
        match answer.message {
            Message::Response(response) => assert_eq!(response.sender, 0),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(inboxes[1].try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_authenticate() {
        let message = Message::Broadcast(Arc::new(Broadcast::new(
            0,
            2,
            Proposal::R(Value::from(9)),
            vec![],
        )));

        assert!(ConsensusProcessor::<ChannelTransport>::authenticate(&Envelope {
            from: 2,
            message: message.clone(),
        })
        .is_ok());
        assert_eq!(
            ConsensusProcessor::<ChannelTransport>::authenticate(&Envelope { from: 1, message }),
            Err(Rejection::UnverifiedSender {
                claimed: 2,
                actual: 1
            })
        );
    }
}
