use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::message::{
    Broadcast, BroadcastId, Decision, Hashable, Message, Proposal, Rank, Response, Step, Value,
};
use super::qc::CertificateValidator;
use super::quorum::{QuorumCollector, StepOutput};
use super::register::Registers;
use super::store::Store;
use crate::common::{Config, ConfigError, Crypto, Digest, ProcessId, Rejection};

/*
    One process of the protocol, as a synchronous state machine:

        Idle -> R-Broadcasting -> R-Collecting -> A-Broadcasting -> A-Collecting
             -> B-Broadcasting -> B-Collecting -> (next rank R-Broadcasting | Decided)

    Every delivered broadcast is answered with the register for its rank
    and step, whatever the phase. The phase only decides when this
    process moves on: a completed quorum for (current rank, collecting
    step) seeds the next broadcast.

    Nothing here touches the network. Callers feed messages into `handle`
    and carry out the returned actions; a broadcast goes to every process
    including this one.
*/

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    Idle,
    Broadcasting(Step),
    Collecting(Step),
    Decided(Value),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Action {
    BroadcastToAll(Message),
    Decided { rank: Rank, value: Value },
}

/// Buffered messages of one future rank, deduplicated and counted per sender.
#[derive(Default)]
struct FutureRank {
    messages: Vec<Message>,
    seen: HashSet<Digest>,
    per_sender: HashMap<ProcessId, usize>,
}

pub struct ConsensusEngine {
    id: ProcessId,
    config: Config,
    crypto: Arc<dyn Crypto>,
    rank: Rank,
    phase: Phase,
    input: Value,
    registers: Registers,
    store: Store,
    collectors: BTreeMap<(Rank, Step), QuorumCollector>,
    /// Responses whose justifications are not yet established.
    pending: BTreeMap<(Rank, Step), Vec<Response>>,
    /// Messages for ranks this process has not reached yet.
    future: BTreeMap<Rank, FutureRank>,
    answered: HashMap<BroadcastId, Rank>,
    seen_responses: HashMap<Digest, Rank>,
    decided_at: Option<Rank>,
}

impl ConsensusEngine {
    pub fn new(
        id: ProcessId,
        config: Config,
        crypto: Arc<dyn Crypto>,
        input: Value,
    ) -> Result<Self, ConfigError> {
        if config.n != 3 * config.f + 1 {
            return Err(ConfigError::InvalidMembership {
                n: config.n,
                f: config.f,
            });
        }
        config.check_member(id)?;

        Ok(ConsensusEngine {
            id,
            store: Store::new(config.quorum()),
            config,
            crypto,
            rank: 0,
            phase: Phase::Idle,
            input,
            registers: Registers::new(),
            collectors: BTreeMap::new(),
            pending: BTreeMap::new(),
            future: BTreeMap::new(),
            answered: HashMap::new(),
            seen_responses: HashMap::new(),
            decided_at: None,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn decision(&self) -> Option<(Rank, &Value)> {
        match (&self.phase, self.decided_at) {
            (Phase::Decided(value), Some(rank)) => Some((rank, value)),
            _ => None,
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Rank 0 step R broadcast of the input. Only leaves `Idle` once.
    pub fn start(&mut self) -> Vec<Action> {
        if self.phase != Phase::Idle {
            return vec![];
        }
        let input = self.input.clone();
        let mut actions = self.broadcast(Proposal::R(input), vec![]);
        actions.extend(self.advance());
        actions
    }

    /// Processes one delivered message. Rejected messages are logged and
    /// produce no actions.
    pub fn handle(&mut self, message: Message) -> Vec<Action> {
        let (rank, step, sender) = (message.rank(), message.step(), message.sender());
        match self.on_message(message) {
            Ok(actions) => actions,
            Err(rejection) => {
                debug!(process = self.id, rank, %step, sender, %rejection, "message rejected");
                vec![]
            }
        }
    }

    pub fn on_message(&mut self, message: Message) -> Result<Vec<Action>, Rejection> {
        let rank = message.rank();
        let stale = self
            .config
            .retention
            .is_some_and(|retention| rank.saturating_add(retention) < self.rank);
        if stale || rank > self.rank.saturating_add(self.config.horizon) {
            return Err(Rejection::StaleOrFutureRank {
                rank,
                current: self.rank,
            });
        }
        if rank > self.ceiling() {
            return self.buffer(message);
        }

        match message {
            Message::Broadcast(broadcast) => self.on_broadcast(broadcast),
            Message::Response(response) => self.on_response(response),
        }
    }

    /// Validates and answers a broadcast. An invalid one is neither
    /// applied to the registers nor answered.
    pub fn on_broadcast(&mut self, broadcast: Arc<Broadcast>) -> Result<Vec<Action>, Rejection> {
        let id = broadcast.id();
        if self.answered.contains_key(&id) {
            return Err(Rejection::DuplicateMessage);
        }
        self.check_broadcast(&broadcast, &id)?;
        Ok(self.deliver(broadcast, id))
    }

    /// A broadcast already answered by more than f processes was checked by
    /// at least one correct process, so its certificate is taken as read.
    fn check_broadcast(&self, broadcast: &Broadcast, id: &BroadcastId) -> Result<(), Rejection> {
        if self.store.is_validated(id) {
            return Ok(());
        }
        if self.store.answer_count(id) > self.config.f {
            trace!(process = self.id, ?id, "broadcast complemented by its answers");
            return Ok(());
        }
        self.validator().validate_broadcast(broadcast)
    }

    pub fn on_response(&mut self, response: Response) -> Result<Vec<Action>, Rejection> {
        let digest = response.hash();
        if self.seen_responses.contains_key(&digest) {
            return Err(Rejection::DuplicateMessage);
        }
        self.validator().validate_response(&response)?;

        let unknown: Vec<Arc<Broadcast>> = response
            .certificate
            .iter()
            .filter(|broadcast| !self.store.is_validated(&broadcast.id()))
            .cloned()
            .collect();
        for broadcast in &unknown {
            self.check_broadcast(broadcast, &broadcast.id())?;
        }
        self.seen_responses.insert(digest, response.rank);

        let mut actions = Vec::new();
        for broadcast in unknown {
            let id = broadcast.id();
            if !self.answered.contains_key(&id) {
                trace!(process = self.id, ?id, "relaying justification");
                actions.extend(self.deliver(broadcast, id));
            }
        }

        if self
            .store
            .record_answer(response.in_reply_to, response.rank, response.sender)
        {
            actions.extend(self.on_established(response.in_reply_to));
        }

        if self
            .validator()
            .validate_response_certificate(&response, &self.store)
        {
            actions.extend(self.accept(response));
        } else {
            trace!(
                process = self.id,
                rank = response.rank,
                sender = response.sender,
                "parking response until its justifications are established"
            );
            self.pending
                .entry((response.rank, response.step()))
                .or_default()
                .push(response);
        }
        Ok(actions)
    }

    /// Most messages kept per sender for one future rank: its three
    /// broadcasts and answers to two broadcasts per member and step.
    fn future_quota(&self) -> usize {
        3 * (2 * self.config.n + 1)
    }

    fn buffer(&mut self, message: Message) -> Result<Vec<Action>, Rejection> {
        let (rank, sender) = (message.rank(), message.sender());
        let key = match &message {
            Message::Broadcast(broadcast) => {
                self.config
                    .check_member(sender)
                    .map_err(|_| Rejection::UnknownSender(sender))?;
                broadcast.id().0
            }
            Message::Response(response) => {
                self.validator().validate_response(response)?;
                response.hash()
            }
        };

        let quota = self.future_quota();
        let slot = self.future.entry(rank).or_default();
        if slot.seen.contains(&key) {
            return Err(Rejection::DuplicateMessage);
        }
        let count = slot.per_sender.entry(sender).or_default();
        if *count >= quota {
            return Err(Rejection::FutureQuotaExceeded { rank, sender });
        }
        *count += 1;
        slot.seen.insert(key);
        slot.messages.push(message);
        trace!(process = self.id, rank, current = self.rank, sender, "buffering future message");
        Ok(vec![])
    }

    fn validator(&self) -> CertificateValidator<'_> {
        CertificateValidator::new(&self.config, self.crypto.as_ref())
    }

    /// Highest rank handled right away; later ranks wait in `future`.
    fn ceiling(&self) -> Rank {
        match self.phase {
            Phase::Decided(_) => self.rank.saturating_add(self.config.horizon),
            _ => self.rank,
        }
    }

    fn deliver(&mut self, broadcast: Arc<Broadcast>, id: BroadcastId) -> Vec<Action> {
        let (rank, step) = (broadcast.rank, broadcast.step());
        let established = self.store.insert_validated(broadcast.clone());
        if self.registers.apply(&broadcast, id) {
            trace!(
                process = self.id,
                rank,
                %step,
                value = %broadcast.proposal.value(),
                "register updated"
            );
        }

        let mut actions = Vec::new();
        match self.respond(rank, step, id) {
            Some(response) => {
                self.answered.insert(id, rank);
                actions.push(Action::BroadcastToAll(Message::Response(response)));
            }
            None => debug!(process = self.id, rank, %step, "no register to answer with"),
        }
        if established {
            actions.extend(self.on_established(id));
        }
        actions
    }

    fn respond(&self, rank: Rank, step: Step, in_reply_to: BroadcastId) -> Option<Response> {
        let (snapshot, justifications) = self.registers.snapshot(rank, step)?;
        let certificate = justifications
            .iter()
            .map(|id| self.store.get(id).cloned())
            .collect::<Option<Vec<_>>>()?;
        let digest = Response::signing_digest(rank, self.id, &in_reply_to, &snapshot, &certificate);

        Some(Response {
            rank,
            sender: self.id,
            in_reply_to,
            snapshot,
            certificate,
            signature: self.crypto.sign(&digest),
        })
    }

    fn on_established(&mut self, id: BroadcastId) -> Vec<Action> {
        let Some(broadcast) = self.store.get(&id) else {
            return vec![];
        };
        let key = (broadcast.rank, broadcast.step());
        let Some(parked) = self.pending.remove(&key) else {
            return vec![];
        };

        let mut actions = Vec::new();
        let mut waiting = Vec::new();
        for response in parked {
            if self
                .validator()
                .validate_response_certificate(&response, &self.store)
            {
                actions.extend(self.accept(response));
            } else {
                waiting.push(response);
            }
        }
        if !waiting.is_empty() {
            self.pending.entry(key).or_default().extend(waiting);
        }
        actions
    }

    fn accept(&mut self, response: Response) -> Vec<Action> {
        let (rank, step, sender) = (response.rank, response.step(), response.sender);
        let threshold = self.config.quorum();
        let collector = self
            .collectors
            .entry((rank, step))
            .or_insert_with(|| QuorumCollector::new(rank, step, threshold));

        match collector.insert(response) {
            Ok(true) => {
                debug!(process = self.id, rank, %step, "quorum complete");
                self.advance()
            }
            Ok(false) => vec![],
            Err(rejection) => {
                debug!(process = self.id, rank, %step, sender, %rejection, "response not counted");
                vec![]
            }
        }
    }

    /// Moves on for as long as the collector of the current step is
    /// complete; the next step's quorum may already be waiting.
    fn advance(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let Phase::Collecting(step) = self.phase else {
                break;
            };
            let Some(collector) = self.collectors.get(&(self.rank, step)) else {
                break;
            };
            let (Some(output), Some(quorum)) = (collector.compute_output(), collector.quorum())
            else {
                break;
            };
            let certificate = quorum.to_vec();

            match output {
                StepOutput::R(max) => {
                    actions.extend(self.broadcast(Proposal::A(max.value), certificate));
                }
                StepOutput::A(pair) => {
                    actions.extend(self.broadcast(Proposal::B(pair), certificate));
                }
                StepOutput::B(Decision::Commit(value)) => {
                    info!(process = self.id, rank = self.rank, %value, "decided");
                    self.phase = Phase::Decided(value.clone());
                    self.decided_at = Some(self.rank);
                    actions.push(Action::Decided {
                        rank: self.rank,
                        value,
                    });
                    actions.extend(self.replay());
                }
                StepOutput::B(Decision::Adopt(value)) => {
                    self.rank += 1;
                    info!(process = self.id, rank = self.rank, %value, "advancing rank");
                    self.prune();
                    actions.extend(self.broadcast(Proposal::R(value), certificate));
                    actions.extend(self.replay());
                }
            }
        }
        actions
    }

    fn broadcast(&mut self, proposal: Proposal, certificate: Vec<Response>) -> Vec<Action> {
        let step = proposal.step();
        self.phase = Phase::Broadcasting(step);
        debug!(
            process = self.id,
            rank = self.rank,
            %step,
            value = %proposal.value(),
            "broadcasting"
        );

        let broadcast = Broadcast::new(self.rank, self.id, proposal, certificate);
        self.phase = Phase::Collecting(step);
        vec![Action::BroadcastToAll(Message::Broadcast(Arc::new(broadcast)))]
    }

    /// Handles buffered messages that the current ceiling now admits.
    fn replay(&mut self) -> Vec<Action> {
        let ceiling = self.ceiling();
        let later = self.future.split_off(&ceiling.saturating_add(1));
        let ready = std::mem::replace(&mut self.future, later);

        let mut actions = Vec::new();
        for message in ready.into_values().flat_map(|slot| slot.messages) {
            actions.extend(self.handle(message));
        }
        actions
    }

    fn prune(&mut self) {
        let Some(retention) = self.config.retention else {
            return;
        };
        let floor = self.rank.saturating_sub(retention);
        if floor == 0 {
            return;
        }

        trace!(process = self.id, floor, "pruning old ranks");
        self.registers.prune_below(floor);
        self.store.prune_below(floor);
        self.collectors = self.collectors.split_off(&(floor, Step::R));
        self.pending = self.pending.split_off(&(floor, Step::R));
        self.answered.retain(|_, rank| *rank >= floor);
        self.seen_responses.retain(|_, rank| *rank >= floor);
    }
}
