use std::fmt;
use std::sync::Arc;

use crate::common::{Digest, DigestBuilder, ProcessId, Signature};

/*
    A process broadcasts once per step of every rank it reaches:

        (R, i, v, C)        C = B-answers of rank i-1, empty at rank 0
        (A, i, v, C)        C = R-answers of rank i
        (B, i, flag, v, C)  C = A-answers of rank i

    Every process that delivers a broadcast answers it, to everybody, with
    the register it keeps for that rank and step together with the
    broadcasts responsible for each value the register holds. Those
    answers are what the broadcaster later compiles into the certificate
    of its next broadcast.
*/

pub const MAX_VALUE_SIZE: usize = 1024;

pub type Rank = u64;

pub trait Hashable {
    fn hash(&self) -> Digest;
}

/// Opaque application payload, totally ordered by its bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value(Vec<u8>);

impl Value {
    pub fn new(bytes: Vec<u8>) -> Self {
        Value(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Big-endian, so the byte order agrees with the numeric order.
impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value(value.to_be_bytes().to_vec())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(bytes) = <[u8; 8]>::try_from(self.0.as_slice()) {
            return write!(f, "{}", u64::from_be_bytes(bytes));
        }
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Step {
    R,
    A,
    B,
}

impl Step {
    pub fn label(&self) -> Label {
        match self {
            Step::R => Label::Resp,
            Step::A => Label::Aresp,
            Step::B => Label::Bresp,
        }
    }

    /// Step whose answers certify a broadcast of this step.
    pub fn previous(&self) -> Step {
        match self {
            Step::R => Step::B,
            Step::A => Step::R,
            Step::B => Step::A,
        }
    }
}

impl AsRef<[u8]> for Step {
    fn as_ref(&self) -> &[u8] {
        match self {
            Step::R => &[1u8],
            Step::A => &[2u8],
            Step::B => &[3u8],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Label {
    Resp,
    Aresp,
    Bresp,
}

impl Label {
    pub fn step(&self) -> Step {
        match self {
            Label::Resp => Step::R,
            Label::Aresp => Step::A,
            Label::Bresp => Step::B,
        }
    }
}

/// Ordered by rank first, then by value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RValue {
    pub rank: Rank,
    pub value: Value,
}

impl RValue {
    pub fn new(rank: Rank, value: Value) -> Self {
        RValue { rank, value }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BValue {
    pub flag: bool,
    pub value: Value,
}

impl BValue {
    pub fn new(flag: bool, value: Value) -> Self {
        BValue { flag, value }
    }
}

/// What a broadcast claims, shaped by its step.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Proposal {
    R(Value),
    A(Value),
    B(BValue),
}

impl Proposal {
    pub fn step(&self) -> Step {
        match self {
            Proposal::R(_) => Step::R,
            Proposal::A(_) => Step::A,
            Proposal::B(_) => Step::B,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Proposal::R(value) | Proposal::A(value) => value,
            Proposal::B(pair) => &pair.value,
        }
    }
}

/// Content address of a broadcast: (step, rank, sender, proposal).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BroadcastId(pub Digest);

impl fmt::Debug for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Broadcast {
    pub rank: Rank,
    pub sender: ProcessId,
    pub proposal: Proposal,
    /// Previous-step answers; empty only for step R of rank 0.
    pub certificate: Vec<Response>,
}

impl Broadcast {
    pub fn new(
        rank: Rank,
        sender: ProcessId,
        proposal: Proposal,
        certificate: Vec<Response>,
    ) -> Self {
        Broadcast {
            rank,
            sender,
            proposal,
            certificate,
        }
    }

    pub fn step(&self) -> Step {
        self.proposal.step()
    }

    pub fn id(&self) -> BroadcastId {
        BroadcastId(self.hash())
    }
}

impl Hashable for Broadcast {
    fn hash(&self) -> Digest {
        let mut builder = DigestBuilder::new(b"broadcast");
        builder
            .bytes(self.step().as_ref())
            .u64(self.rank)
            .u64(self.sender as u64);
        match &self.proposal {
            Proposal::R(value) | Proposal::A(value) => builder.bytes(value.as_bytes()),
            Proposal::B(pair) => builder.u64(pair.flag as u64).bytes(pair.value.as_bytes()),
        };
        builder.finish()
    }
}

/// Register contents carried by a response.
///
/// A snapshots are strictly decreasing; B snapshots list the true pair
/// before the false pair.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Snapshot {
    R(RValue),
    A(Vec<Value>),
    B(Vec<BValue>),
}

impl Snapshot {
    pub fn step(&self) -> Step {
        match self {
            Snapshot::R(_) => Step::R,
            Snapshot::A(_) => Step::A,
            Snapshot::B(_) => Step::B,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::R(_) => 1,
            Snapshot::A(values) => values.len(),
            Snapshot::B(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `proposal` carries exactly the `index`-th entry.
    pub fn justified_by(&self, index: usize, rank: Rank, proposal: &Proposal) -> bool {
        match (self, proposal) {
            (Snapshot::R(held), Proposal::R(value)) => {
                index == 0 && held.rank == rank && &held.value == value
            }
            (Snapshot::A(values), Proposal::A(value)) => values.get(index) == Some(value),
            (Snapshot::B(pairs), Proposal::B(pair)) => pairs.get(index) == Some(pair),
            _ => false,
        }
    }

    /// Checks the structural invariants a correct register always upholds.
    pub fn check_shape(&self) -> Result<(), String> {
        match self {
            Snapshot::R(held) => check_size(&held.value),
            Snapshot::A(values) => {
                if values.is_empty() || values.len() > 2 {
                    return Err(format!("A snapshot holds {} values", values.len()));
                }
                if values.len() == 2 && values[0] <= values[1] {
                    return Err("A snapshot is not strictly decreasing".to_string());
                }
                values.iter().try_for_each(check_size)
            }
            Snapshot::B(pairs) => {
                if pairs.is_empty() || pairs.len() > 2 {
                    return Err(format!("B snapshot holds {} pairs", pairs.len()));
                }
                if pairs.len() == 2 && !(pairs[0].flag && !pairs[1].flag) {
                    return Err("B snapshot needs one true pair then one false pair".to_string());
                }
                pairs.iter().try_for_each(|pair| check_size(&pair.value))
            }
        }
    }

    fn feed(&self, builder: &mut DigestBuilder) {
        builder.bytes(self.step().as_ref());
        match self {
            Snapshot::R(held) => {
                builder.u64(held.rank).bytes(held.value.as_bytes());
            }
            Snapshot::A(values) => {
                builder.u64(values.len() as u64);
                for value in values {
                    builder.bytes(value.as_bytes());
                }
            }
            Snapshot::B(pairs) => {
                builder.u64(pairs.len() as u64);
                for pair in pairs {
                    builder.u64(pair.flag as u64).bytes(pair.value.as_bytes());
                }
            }
        }
    }
}

pub fn check_size(value: &Value) -> Result<(), String> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(format!("value of {} bytes exceeds {}", value.len(), MAX_VALUE_SIZE));
    }
    Ok(())
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Response {
    pub rank: Rank,
    pub sender: ProcessId,
    /// The broadcast this response answers.
    pub in_reply_to: BroadcastId,
    pub snapshot: Snapshot,
    /// Broadcast responsible for each snapshot entry, in the same order.
    pub certificate: Vec<Arc<Broadcast>>,
    pub signature: Signature,
}

impl Response {
    pub fn label(&self) -> Label {
        self.snapshot.step().label()
    }

    pub fn step(&self) -> Step {
        self.snapshot.step()
    }

    /// Digest covered by the sender's signature.
    pub fn signing_digest(
        rank: Rank,
        sender: ProcessId,
        in_reply_to: &BroadcastId,
        snapshot: &Snapshot,
        certificate: &[Arc<Broadcast>],
    ) -> Digest {
        let mut builder = DigestBuilder::new(b"response");
        builder
            .u64(rank)
            .u64(sender as u64)
            .bytes(&in_reply_to.0);
        snapshot.feed(&mut builder);
        for broadcast in certificate {
            builder.bytes(&broadcast.hash());
        }
        builder.finish()
    }
}

impl Hashable for Response {
    fn hash(&self) -> Digest {
        Response::signing_digest(
            self.rank,
            self.sender,
            &self.in_reply_to,
            &self.snapshot,
            &self.certificate,
        )
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Broadcast(Arc<Broadcast>),
    Response(Response),
}

impl Message {
    pub fn sender(&self) -> ProcessId {
        match self {
            Message::Broadcast(broadcast) => broadcast.sender,
            Message::Response(response) => response.sender,
        }
    }

    pub fn rank(&self) -> Rank {
        match self {
            Message::Broadcast(broadcast) => broadcast.rank,
            Message::Response(response) => response.rank,
        }
    }

    pub fn step(&self) -> Step {
        match self {
            Message::Broadcast(broadcast) => broadcast.step(),
            Message::Response(response) => response.step(),
        }
    }
}

/// Outcome of a B-step quorum.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Decision {
    Commit(Value),
    Adopt(Value),
}

impl Decision {
    pub fn value(&self) -> &Value {
        match self {
            Decision::Commit(value) | Decision::Adopt(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_id_ignores_certificate() {
        let bare = Broadcast::new(5, 1, Proposal::R(Value::from(42)), vec![]);
        let mut certified = bare.clone();
        certified.certificate.push(Response {
            rank: 4,
            sender: 2,
            in_reply_to: bare.id(),
            snapshot: Snapshot::B(vec![BValue::new(false, Value::from(42))]),
            certificate: vec![],
            signature: Signature::unsigned(2),
        });

        assert_eq!(bare.id(), certified.id());
    }

    #[test]
    fn test_broadcast_id_covers_sender_and_shape() {
        let base = Broadcast::new(5, 1, Proposal::A(Value::from(42)), vec![]);
        let other_sender = Broadcast::new(5, 2, Proposal::A(Value::from(42)), vec![]);
        let other_step = Broadcast::new(5, 1, Proposal::R(Value::from(42)), vec![]);
        let other_value = Broadcast::new(5, 1, Proposal::A(Value::from(43)), vec![]);

        assert_ne!(base.id(), other_sender.id());
        assert_ne!(base.id(), other_step.id());
        assert_ne!(base.id(), other_value.id());
    }

    #[test]
    fn test_rvalue_orders_by_rank_then_value() {
        let low_rank = RValue::new(1, Value::from(100));
        let high_rank = RValue::new(2, Value::from(1));
        let same_rank_higher = RValue::new(2, Value::from(5));

        assert!(low_rank < high_rank);
        assert!(high_rank < same_rank_higher);
    }

    #[test]
    fn test_snapshot_shape() {
        let ten = Value::from(10);
        let twenty = Value::from(20);

        assert!(Snapshot::A(vec![twenty.clone(), ten.clone()]).check_shape().is_ok());
        assert!(Snapshot::A(vec![ten.clone(), twenty.clone()]).check_shape().is_err());
        assert!(Snapshot::A(vec![ten.clone(), ten.clone()]).check_shape().is_err());
        assert!(Snapshot::A(vec![]).check_shape().is_err());
        assert!(Snapshot::B(vec![
            BValue::new(true, ten.clone()),
            BValue::new(false, twenty.clone())
        ])
        .check_shape()
        .is_ok());
        assert!(Snapshot::B(vec![
            BValue::new(true, ten.clone()),
            BValue::new(true, twenty.clone())
        ])
        .check_shape()
        .is_err());
        assert!(Snapshot::R(RValue::new(0, Value::new(vec![0; MAX_VALUE_SIZE + 1])))
            .check_shape()
            .is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::from(20).to_string(), "20");
        assert_eq!(Value::new(vec![0xab, 0x01]).to_string(), "ab01");
    }
}
