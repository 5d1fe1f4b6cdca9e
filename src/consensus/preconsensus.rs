use std::collections::{BTreeMap, BTreeSet};

use super::message::{Hashable, Value, MAX_VALUE_SIZE};
use crate::common::{Config, Digest, DigestBuilder, PreconsensusError, ProcessId};

/*
    Before agreement each process announces the frontiers it has seen
    confirmed, as a preproposal. A proposal names 2f+1 preproposals from
    distinct processes by hash, and the value the processes agree on is that
    proposal. Whatever is confirmed has been confirmed by at least one correct
    process among any 2f+1, so the union of the named frontiers contains it.

    Both hashes are over sorted sets: the order frontiers or preproposals
    were gathered in never changes what is agreed.
*/

pub const MAX_FRONTIERS: usize = 1000;

/// Hash of a confirmed block at the tip of some chain.
pub type Frontier = Digest;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PreProposal {
    pub sender: ProcessId,
    pub frontiers: BTreeSet<Frontier>,
}

impl PreProposal {
    pub fn new(sender: ProcessId, frontiers: impl IntoIterator<Item = Frontier>) -> Self {
        PreProposal {
            sender,
            frontiers: frontiers.into_iter().collect(),
        }
    }

    pub fn check(&self, config: &Config) -> Result<(), PreconsensusError> {
        config
            .check_member(self.sender)
            .map_err(|_| PreconsensusError::UnknownSender(self.sender))?;
        if self.frontiers.len() > MAX_FRONTIERS {
            return Err(PreconsensusError::TooManyFrontiers {
                count: self.frontiers.len(),
                max: MAX_FRONTIERS,
            });
        }
        Ok(())
    }
}

/// Covers the frontiers only, so equal sets from different senders collide.
impl Hashable for PreProposal {
    fn hash(&self) -> Digest {
        let mut builder = DigestBuilder::new(b"preproposal");
        builder.u64(self.frontiers.len() as u64);
        for frontier in &self.frontiers {
            builder.bytes(frontier);
        }
        builder.finish()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PreconsensusProposal {
    pub preproposals: BTreeSet<Digest>,
}

impl PreconsensusProposal {
    /// Names the first 2f+1 valid preproposals from distinct members.
    pub fn create(
        config: &Config,
        preproposals: &[PreProposal],
    ) -> Result<Self, PreconsensusError> {
        let mut chosen: BTreeMap<ProcessId, Digest> = BTreeMap::new();
        for preproposal in preproposals {
            if chosen.len() == config.quorum() {
                break;
            }
            preproposal.check(config)?;
            if chosen.insert(preproposal.sender, preproposal.hash()).is_some() {
                return Err(PreconsensusError::DuplicatePreProposal(preproposal.sender));
            }
        }
        if chosen.len() < config.quorum() {
            return Err(PreconsensusError::TooFewPreProposals {
                got: chosen.len(),
                need: config.quorum(),
            });
        }

        Ok(PreconsensusProposal {
            preproposals: chosen.into_values().collect(),
        })
    }

    /// Union of the frontiers of every known preproposal this proposal names.
    pub fn frontiers<'a>(
        &self,
        known: impl IntoIterator<Item = &'a PreProposal>,
    ) -> BTreeSet<Frontier> {
        known
            .into_iter()
            .filter(|preproposal| self.preproposals.contains(&preproposal.hash()))
            .flat_map(|preproposal| preproposal.frontiers.iter().copied())
            .collect()
    }

    /// Named preproposals absent from `known`, which must be fetched before
    /// the frontiers are complete.
    pub fn missing<'a>(&self, known: impl IntoIterator<Item = &'a PreProposal>) -> Vec<Digest> {
        let known: BTreeSet<Digest> = known.into_iter().map(Hashable::hash).collect();
        self.preproposals
            .iter()
            .filter(|hash| !known.contains(*hash))
            .copied()
            .collect()
    }

    /// The consensus value: the sorted preproposal hashes, back to back.
    pub fn to_value(&self) -> Result<Value, PreconsensusError> {
        let bytes: Vec<u8> = self.preproposals.iter().flatten().copied().collect();
        if bytes.len() > MAX_VALUE_SIZE {
            return Err(PreconsensusError::ProposalTooLarge(bytes.len()));
        }
        Ok(Value::new(bytes))
    }

    pub fn from_value(value: &Value) -> Result<Self, PreconsensusError> {
        let bytes = value.as_bytes();
        let width = std::mem::size_of::<Digest>();
        if bytes.is_empty() || bytes.len() % width != 0 {
            return Err(PreconsensusError::MalformedProposal(format!(
                "{} bytes is not a whole number of hashes",
                bytes.len()
            )));
        }

        let mut preproposals = BTreeSet::new();
        for chunk in bytes.chunks_exact(width) {
            let mut hash = [0u8; 64];
            hash.copy_from_slice(chunk);
            if !preproposals.insert(hash) {
                return Err(PreconsensusError::MalformedProposal(
                    "a preproposal is named twice".to_string(),
                ));
            }
        }
        Ok(PreconsensusProposal { preproposals })
    }
}

impl Hashable for PreconsensusProposal {
    fn hash(&self) -> Digest {
        let mut builder = DigestBuilder::new(b"proposal");
        builder.u64(self.preproposals.len() as u64);
        for hash in &self.preproposals {
            builder.bytes(hash);
        }
        builder.finish()
    }
}
