use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::message::{Broadcast, BroadcastId, Rank};
use crate::common::ProcessId;

/// Content-addressed ledger of the broadcasts this process has validated and
/// of who has been seen answering them.
///
/// A broadcast becomes *established* once it is validated here and 2f+1
/// distinct processes have answered it. The bit is computed once and kept,
/// so a response justified by it never re-walks the justification chain.
pub struct Store {
    quorum: usize,
    validated: HashMap<BroadcastId, Arc<Broadcast>>,
    answers: HashMap<BroadcastId, (Rank, BTreeSet<ProcessId>)>,
    established: HashSet<BroadcastId>,
}

impl Store {
    pub fn new(quorum: usize) -> Self {
        Store {
            quorum,
            validated: HashMap::new(),
            answers: HashMap::new(),
            established: HashSet::new(),
        }
    }

    /// Records a broadcast whose certificate checked out. Returns whether it
    /// became established, which happens when its answers arrived first.
    pub fn insert_validated(&mut self, broadcast: Arc<Broadcast>) -> bool {
        let id = broadcast.id();
        self.validated.entry(id).or_insert(broadcast);
        self.try_establish(id)
    }

    /// Counts `sender` as having answered `id`. Returns whether this answer
    /// made the broadcast established.
    pub fn record_answer(&mut self, id: BroadcastId, rank: Rank, sender: ProcessId) -> bool {
        let (_, senders) = self
            .answers
            .entry(id)
            .or_insert_with(|| (rank, BTreeSet::new()));
        if !senders.insert(sender) {
            return false;
        }
        self.try_establish(id)
    }

    fn try_establish(&mut self, id: BroadcastId) -> bool {
        if self.established.contains(&id) || !self.validated.contains_key(&id) {
            return false;
        }
        let answered = self
            .answers
            .get(&id)
            .map_or(0, |(_, senders)| senders.len());
        if answered < self.quorum {
            return false;
        }
        self.established.insert(id);
        true
    }

    pub fn is_established(&self, id: &BroadcastId) -> bool {
        self.established.contains(id)
    }

    pub fn is_validated(&self, id: &BroadcastId) -> bool {
        self.validated.contains_key(id)
    }

    pub fn get(&self, id: &BroadcastId) -> Option<&Arc<Broadcast>> {
        self.validated.get(id)
    }

    pub fn answer_count(&self, id: &BroadcastId) -> usize {
        self.answers
            .get(id)
            .map_or(0, |(_, senders)| senders.len())
    }

    /// Forgets everything about ranks below `rank`.
    pub fn prune_below(&mut self, rank: Rank) {
        self.validated.retain(|_, broadcast| broadcast.rank >= rank);
        self.answers.retain(|_, (answered, _)| *answered >= rank);
        let validated = &self.validated;
        self.established.retain(|id| validated.contains_key(id));
    }
}
