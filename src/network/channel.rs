use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{Envelope, Transport};
use crate::common::{NetworkError, ProcessId};
use crate::consensus::message::Message;

/// In-process transport: one unbounded tokio channel per process.
#[derive(Clone)]
pub struct ChannelTransport {
    id: ProcessId,
    peers: Vec<UnboundedSender<Envelope>>,
}

impl ChannelTransport {
    /// Fully connected mesh of `n` processes. The i-th transport sends as
    /// process i; the i-th receiver is process i's inbox.
    pub fn mesh(n: usize) -> (Vec<ChannelTransport>, Vec<UnboundedReceiver<Envelope>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| unbounded_channel()).unzip();
        let transports = (0..n as ProcessId)
            .map(|id| ChannelTransport {
                id,
                peers: senders.clone(),
            })
            .collect();
        (transports, receivers)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: Message, to: ProcessId) -> Result<(), NetworkError> {
        let peer = self
            .peers
            .get(to as usize)
            .ok_or(NetworkError::UnknownPeer(to))?;
        peer.send(Envelope {
            from: self.id,
            message,
        })
        .map_err(|_| NetworkError::Closed(to))
    }

    /// Sends to every peer even if some are gone, reporting the first failure.
    fn broadcast_to_all(&self, message: Message) -> Result<(), NetworkError> {
        let mut result = Ok(());
        for to in 0..self.peers.len() as ProcessId {
            if let Err(error) = self.send(message.clone(), to) {
                result = result.and(Err(error));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::consensus::message::{Broadcast, Proposal, Value};

    fn message() -> Message {
        Message::Broadcast(Arc::new(Broadcast::new(0, 1, Proposal::R(Value::from(5)), vec![])))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_self() {
        let (transports, mut inboxes) = ChannelTransport::mesh(3);

        transports[1].broadcast_to_all(message()).unwrap();

        for inbox in inboxes.iter_mut() {
            let envelope = inbox.recv().await.unwrap();
            assert_eq!(envelope.from, 1);
            assert_eq!(envelope.message, message());
        }
    }

    #[tokio::test]
    async fn test_reports_closed_and_unknown_peers() {
        let (transports, mut inboxes) = ChannelTransport::mesh(3);
        drop(inboxes.remove(2));

        assert_eq!(transports[0].send(message(), 7), Err(NetworkError::UnknownPeer(7)));
        assert_eq!(
            transports[0].broadcast_to_all(message()),
            Err(NetworkError::Closed(2))
        );
        assert!(inboxes[1].recv().await.is_some());
    }
}
