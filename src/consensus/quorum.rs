use std::collections::BTreeSet;

use super::message::{BValue, Decision, RValue, Rank, Response, Step};
use super::qc::{reduce_a, reduce_b, reduce_r};
use crate::common::{ProcessId, Rejection};

/// Result of a completed quorum, seeding the next broadcast.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StepOutput {
    R(RValue),
    A(BValue),
    B(Decision),
}

/// Accepted responses for one (rank, step), at most one per sender, in
/// arrival order.
#[derive(Debug)]
pub struct QuorumCollector {
    rank: Rank,
    step: Step,
    threshold: usize,
    responses: Vec<Response>,
    senders: BTreeSet<ProcessId>,
}

impl QuorumCollector {
    pub fn new(rank: Rank, step: Step, threshold: usize) -> Self {
        QuorumCollector {
            rank,
            step,
            threshold,
            responses: Vec::new(),
            senders: BTreeSet::new(),
        }
    }

    /// Keeps the first response of each sender. Returns whether this one
    /// completed the quorum.
    pub fn insert(&mut self, response: Response) -> Result<bool, Rejection> {
        if response.rank != self.rank || response.step() != self.step {
            return Err(Rejection::InvalidCertificate(format!(
                "{:?} of rank {} offered to the {:?} collector of rank {}",
                response.label(),
                response.rank,
                self.step.label(),
                self.rank
            )));
        }
        if !self.senders.insert(response.sender) {
            return Err(Rejection::DuplicateSenderResponse(response.sender));
        }

        self.responses.push(response);
        Ok(self.responses.len() == self.threshold)
    }

    pub fn is_complete(&self) -> bool {
        self.senders.len() >= self.threshold
    }

    /// The first 2f+1 accepted responses, once there are that many.
    pub fn quorum(&self) -> Option<&[Response]> {
        self.responses.get(..self.threshold)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn compute_output(&self) -> Option<StepOutput> {
        let snapshots = self.quorum()?.iter().map(|response| &response.snapshot);
        match self.step {
            Step::R => reduce_r(snapshots).map(StepOutput::R),
            Step::A => reduce_a(snapshots).map(StepOutput::A),
            Step::B => reduce_b(snapshots).map(StepOutput::B),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Signature;
    use crate::consensus::message::{BroadcastId, Snapshot, Value};

    fn a_answer(sender: ProcessId, values: &[u64]) -> Response {
        Response {
            rank: 1,
            sender,
            in_reply_to: BroadcastId([sender as u8; 64]),
            snapshot: Snapshot::A(values.iter().map(|v| Value::from(*v)).collect()),
            certificate: vec![],
            signature: Signature::unsigned(sender),
        }
    }

    #[test]
    fn test_completes_at_threshold() {
        let mut collector = QuorumCollector::new(1, Step::A, 3);

        assert_eq!(collector.insert(a_answer(0, &[20])), Ok(false));
        assert_eq!(collector.insert(a_answer(2, &[20])), Ok(false));
        assert!(!collector.is_complete());
        assert!(collector.compute_output().is_none());

        assert_eq!(collector.insert(a_answer(3, &[20])), Ok(true));
        assert!(collector.is_complete());
        assert_eq!(
            collector.compute_output(),
            Some(StepOutput::A(BValue::new(true, Value::from(20))))
        );

        assert_eq!(collector.insert(a_answer(1, &[30, 20])), Ok(false));
        assert_eq!(collector.len(), 4);
        assert_eq!(
            collector.compute_output(),
            Some(StepOutput::A(BValue::new(true, Value::from(20))))
        );
    }

    #[test]
    fn test_first_response_per_sender_counts() {
        let mut collector = QuorumCollector::new(1, Step::A, 3);

        assert_eq!(collector.insert(a_answer(0, &[5])), Ok(false));
        assert_eq!(
            collector.insert(a_answer(0, &[9])),
            Err(Rejection::DuplicateSenderResponse(0))
        );
        assert_eq!(collector.len(), 1);

        collector.insert(a_answer(1, &[5])).unwrap();
        collector.insert(a_answer(2, &[5])).unwrap();
        assert_eq!(
            collector.compute_output(),
            Some(StepOutput::A(BValue::new(true, Value::from(5))))
        );
    }

    #[test]
    fn test_rejects_other_rank_or_step() {
        let mut collector = QuorumCollector::new(2, Step::A, 3);

        assert!(matches!(
            collector.insert(a_answer(0, &[5])),
            Err(Rejection::InvalidCertificate(_))
        ));
        assert!(collector.is_empty());
    }
}
