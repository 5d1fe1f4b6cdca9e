use std::collections::{BTreeMap, BTreeSet};

use super::message::{
    check_size, BValue, Broadcast, Decision, Hashable, Proposal, RValue, Response, Snapshot, Step,
    Value,
};
use super::register::TopTwo;
use super::store::Store;
use crate::common::{Config, Crypto, ProcessId, Rejection};

/*
    A certificate is the evidence attached to a message.

    For a broadcast it is the 2f+1 previous-step answers the broadcaster
    gathered; anybody can recompute the previous step's deterministic
    reduction over them and check the broadcast claims exactly its result.

    For a response it is the list of broadcasts responsible for the values
    in the snapshot. Those are only trusted once 2f+1 processes have been
    seen answering them, which this process tracks in the `Store`.

    Signature checks go through `Crypto`; with `Unverified` they reduce to
    checking the claimed signer and the certificate is structural only.
*/

/// Greatest (rank, value) among R snapshots.
pub fn reduce_r<'a>(snapshots: impl IntoIterator<Item = &'a Snapshot>) -> Option<RValue> {
    snapshots
        .into_iter()
        .filter_map(|snapshot| match snapshot {
            Snapshot::R(held) => Some(held),
            _ => None,
        })
        .max()
        .cloned()
}

/// `(true, v)` if the A snapshots only ever carry `v`, else `(false, max)`.
pub fn reduce_a<'a>(snapshots: impl IntoIterator<Item = &'a Snapshot>) -> Option<BValue> {
    let mut greatest = TopTwo::default();
    for snapshot in snapshots {
        if let Snapshot::A(values) = snapshot {
            for value in values {
                greatest.insert(value);
            }
        }
    }

    let single = greatest.len() == 1;
    greatest
        .first()
        .map(|value| BValue::new(single, (*value).clone()))
}

/// Commit when every B snapshot is the same lone true pair. Otherwise adopt
/// the most frequent value, true pairs taking precedence over false pairs
/// and ties going to the greater value.
pub fn reduce_b<'a>(snapshots: impl IntoIterator<Item = &'a Snapshot>) -> Option<Decision> {
    let pairs: Vec<&Vec<BValue>> = snapshots
        .into_iter()
        .filter_map(|snapshot| match snapshot {
            Snapshot::B(pairs) => Some(pairs),
            _ => None,
        })
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let mut unanimous: Option<&Value> = None;
    let committed = pairs.iter().all(|held| match held.as_slice() {
        [pair] if pair.flag && unanimous.map_or(true, |value| value == &pair.value) => {
            unanimous = Some(&pair.value);
            true
        }
        _ => false,
    });
    if let (true, Some(value)) = (committed, unanimous) {
        return Some(Decision::Commit(value.clone()));
    }

    let any_true = pairs.iter().flat_map(|held| held.iter()).any(|pair| pair.flag);
    let mut counts: BTreeMap<&Value, usize> = BTreeMap::new();
    for pair in pairs.iter().flat_map(|held| held.iter()) {
        if pair.flag || !any_true {
            *counts.entry(&pair.value).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|(left, left_count), (right, right_count)| {
            left_count.cmp(right_count).then(left.cmp(right))
        })
        .map(|(value, _)| Decision::Adopt(value.clone()))
}

pub struct CertificateValidator<'a> {
    config: &'a Config,
    crypto: &'a dyn Crypto,
}

impl<'a> CertificateValidator<'a> {
    pub fn new(config: &'a Config, crypto: &'a dyn Crypto) -> Self {
        CertificateValidator { config, crypto }
    }

    /// Checks that the broadcast's certificate holds answers from 2f+1
    /// distinct processes for the previous step and that the claimed value is
    /// the previous step's reduction over them.
    pub fn validate_broadcast(&self, broadcast: &Broadcast) -> Result<(), Rejection> {
        self.check_member(broadcast.sender)?;
        check_size(broadcast.proposal.value()).map_err(Rejection::MalformedValue)?;

        let step = broadcast.step();
        if step == Step::R && broadcast.rank == 0 {
            return Ok(());
        }

        let certified_step = step.previous();
        let certified_rank = match step {
            Step::R => broadcast.rank - 1,
            Step::A | Step::B => broadcast.rank,
        };

        let mut senders = BTreeSet::new();
        for response in &broadcast.certificate {
            if response.step() != certified_step || response.rank != certified_rank {
                return Err(Rejection::InvalidCertificate(format!(
                    "expected {:?} answers of rank {}, found {:?} of rank {}",
                    certified_step.label(),
                    certified_rank,
                    response.label(),
                    response.rank
                )));
            }
            response
                .snapshot
                .check_shape()
                .map_err(Rejection::MalformedValue)?;
            self.check_member(response.sender)?;
            self.check_signature(response)?;
            if !senders.insert(response.sender) {
                return Err(Rejection::InvalidCertificate(format!(
                    "sender {} appears twice",
                    response.sender
                )));
            }
        }

        if senders.len() < self.config.quorum() {
            return Err(Rejection::InvalidCertificate(format!(
                "{} distinct answers, need {}",
                senders.len(),
                self.config.quorum()
            )));
        }

        let snapshots = broadcast.certificate.iter().map(|response| &response.snapshot);
        let matches = match &broadcast.proposal {
            Proposal::A(value) => reduce_r(snapshots).is_some_and(|max| &max.value == value),
            Proposal::B(pair) => reduce_a(snapshots).as_ref() == Some(pair),
            Proposal::R(value) => {
                matches!(reduce_b(snapshots), Some(Decision::Adopt(adopted)) if &adopted == value)
            }
        };
        if !matches {
            return Err(Rejection::InvalidCertificate(format!(
                "{:?} claim does not follow from its {:?} answers",
                step,
                certified_step.label()
            )));
        }

        Ok(())
    }

    /// Structural and signature checks of a response: a well-formed snapshot
    /// whose every entry is carried by a justifying broadcast of the same
    /// rank and step.
    pub fn validate_response(&self, response: &Response) -> Result<(), Rejection> {
        self.check_member(response.sender)?;
        response
            .snapshot
            .check_shape()
            .map_err(Rejection::MalformedValue)?;

        if response.certificate.len() != response.snapshot.len() {
            return Err(Rejection::InvalidCertificate(format!(
                "{} justifications for {} entries",
                response.certificate.len(),
                response.snapshot.len()
            )));
        }
        for (index, broadcast) in response.certificate.iter().enumerate() {
            if broadcast.step() != response.step()
                || broadcast.rank != response.rank
                || !response
                    .snapshot
                    .justified_by(index, response.rank, &broadcast.proposal)
            {
                return Err(Rejection::InvalidCertificate(format!(
                    "justification {} does not carry the snapshot entry",
                    index
                )));
            }
        }

        self.check_signature(response)
    }

    /// Whether every broadcast justifying the response has already been
    /// validated here and answered by 2f+1 processes.
    pub fn validate_response_certificate(&self, response: &Response, store: &Store) -> bool {
        response
            .certificate
            .iter()
            .all(|broadcast| store.is_established(&broadcast.id()))
    }

    fn check_member(&self, sender: ProcessId) -> Result<(), Rejection> {
        self.config
            .check_member(sender)
            .map_err(|_| Rejection::UnknownSender(sender))
    }

    fn check_signature(&self, response: &Response) -> Result<(), Rejection> {
        if self
            .crypto
            .verify(&response.hash(), &response.signature, response.sender)
        {
            Ok(())
        } else {
            Err(Rejection::BadSignature(response.sender))
        }
    }
}
