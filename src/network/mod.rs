pub mod channel;
pub mod node;
pub mod sim;

pub use channel::*;
pub use node::*;

use crate::common::{NetworkError, ProcessId};
use crate::consensus::message::Message;

/*
    Point-to-point links are authenticated and eventually reliable between
    correct processes, with no ordering and possible duplication. A
    "broadcast" is the same message sent to every process, including the
    sender itself. Timeouts and retransmission live below this interface;
    the consensus core never waits on a timer.
*/

/// A message together with the process the link says it came from.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: ProcessId,
    pub message: Message,
}

pub trait Transport: Send + 'static {
    fn send(&self, message: Message, to: ProcessId) -> Result<(), NetworkError>;

    fn broadcast_to_all(&self, message: Message) -> Result<(), NetworkError>;
}
