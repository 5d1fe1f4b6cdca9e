//! Deterministic single-threaded network for running whole clusters in tests.
//!
//! Every message sent is queued per recipient and delivered one at a time,
//! either in send order or in an order drawn from a seeded `ChaCha8Rng`. The
//! same seed always replays the same execution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::common::{Config, ConfigError, Crypto, Ed25519Crypto, Keypair, ProcessId, Unverified};
use crate::consensus::engine::{Action, ConsensusEngine};
use crate::consensus::message::{
    BValue, Broadcast, BroadcastId, Message, Proposal, Rank, Step, Value,
};
use crate::consensus::peers::Peers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Oldest message first.
    Fifo,
    /// Any queued message, uniformly.
    Random,
}

/// How a faulty process departs from the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Sends nothing and ignores everything.
    Silent,
    /// Runs the protocol, but odd-numbered peers receive its broadcasts
    /// with the given value swapped in.
    Equivocate(Value),
    /// Runs the protocol, and next to each of its A broadcasts sends a
    /// rival A broadcast for the given value backed by a single answer.
    Inject(Value),
}

#[derive(Clone, Debug)]
pub struct Simulation {
    config: Config,
    inputs: Vec<Value>,
    seed: u64,
    delivery: Delivery,
    faults: BTreeMap<ProcessId, Fault>,
    duplication: f64,
    signed: bool,
    start_order: Option<Vec<ProcessId>>,
}

/// What a run produced.
#[derive(Debug)]
pub struct Outcome {
    pub decisions: BTreeMap<ProcessId, (Rank, Value)>,
    pub faulty: BTreeSet<ProcessId>,
    /// Every message handed to the network, with the process that sent it.
    pub trace: Vec<(ProcessId, Message)>,
    /// Broadcasts fabricated by `Fault::Inject` processes.
    pub injected: Vec<BroadcastId>,
    pub delivered: usize,
    pub ranks: BTreeMap<ProcessId, Rank>,
}

impl Outcome {
    pub fn correct_decisions(&self) -> impl Iterator<Item = (&ProcessId, &(Rank, Value))> {
        self.decisions
            .iter()
            .filter(|(id, _)| !self.faulty.contains(*id))
    }

    pub fn all_correct_decided(&self, config: &Config) -> bool {
        config
            .members()
            .filter(|id| !self.faulty.contains(id))
            .all(|id| self.decisions.contains_key(&id))
    }

    /// The single value correct processes decided, if they agree.
    pub fn agreed_value(&self) -> Option<&Value> {
        let mut values = self.correct_decisions().map(|(_, (_, value))| value);
        let first = values.next()?;
        values.all(|value| value == first).then_some(first)
    }

    /// Correct processes that answered the broadcast `id`.
    pub fn answered_by(&self, id: &BroadcastId) -> BTreeSet<ProcessId> {
        self.trace
            .iter()
            .filter(|(from, _)| !self.faulty.contains(from))
            .filter_map(|(from, message)| match message {
                Message::Response(response) if &response.in_reply_to == id => Some(*from),
                _ => None,
            })
            .collect()
    }
}

impl Simulation {
    pub fn new(config: Config, inputs: Vec<Value>, seed: u64) -> Self {
        Simulation {
            config,
            inputs,
            seed,
            delivery: Delivery::Random,
            faults: BTreeMap::new(),
            duplication: 0.0,
            signed: false,
            start_order: None,
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_fault(mut self, id: ProcessId, fault: Fault) -> Self {
        self.faults.insert(id, fault);
        self
    }

    /// Probability that a message is queued a second time. NaN counts as 0.
    pub fn with_duplication(mut self, probability: f64) -> Self {
        self.duplication = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_start_order(mut self, order: Vec<ProcessId>) -> Self {
        self.start_order = Some(order);
        self
    }

    /// Runs until every correct process has decided or `max_deliveries`
    /// messages have been delivered.
    pub fn run(&self, max_deliveries: usize) -> Result<Outcome, ConfigError> {
        if self.inputs.len() != self.config.n {
            return Err(ConfigError::InputCount {
                expected: self.config.n,
                actual: self.inputs.len(),
            });
        }

        let keys: Vec<Keypair> = self
            .config
            .members()
            .map(|id| Keypair::from_seed(key_seed(self.seed, id)))
            .collect();
        let peers = Peers::for_config(&self.config, keys.iter().map(Keypair::pubkey).collect())?;

        let mut engines = Vec::with_capacity(self.config.n);
        for (id, input) in self.config.members().zip(&self.inputs) {
            if self.faults.get(&id) == Some(&Fault::Silent) {
                engines.push(None);
                continue;
            }
            let crypto: Arc<dyn Crypto> = if self.signed {
                Arc::new(Ed25519Crypto::new(
                    id,
                    Keypair::from_seed(key_seed(self.seed, id)),
                    peers.clone(),
                ))
            } else {
                Arc::new(Unverified::new(id))
            };
            engines.push(Some(ConsensusEngine::new(
                id,
                self.config.clone(),
                crypto,
                input.clone(),
            )?));
        }

        let mut network = Network {
            simulation: self,
            queue: VecDeque::new(),
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            outcome: Outcome {
                decisions: BTreeMap::new(),
                faulty: self.faults.keys().copied().collect(),
                trace: Vec::new(),
                injected: Vec::new(),
                delivered: 0,
                ranks: BTreeMap::new(),
            },
        };

        let order = self
            .start_order
            .clone()
            .unwrap_or_else(|| self.config.members().collect());
        for id in order {
            if let Some(Some(engine)) = engines.get_mut(id as usize) {
                let actions = engine.start();
                network.dispatch(id, actions);
            }
        }

        while network.outcome.delivered < max_deliveries
            && !network.outcome.all_correct_decided(&self.config)
        {
            let Some((to, message)) = network.next() else {
                debug!("network drained");
                break;
            };
            network.outcome.delivered += 1;
            if let Some(Some(engine)) = engines.get_mut(to as usize) {
                let actions = engine.handle(message);
                network.dispatch(to, actions);
            }
        }

        let mut outcome = network.outcome;
        outcome.ranks = engines
            .iter()
            .flatten()
            .map(|engine| (engine.id(), engine.rank()))
            .collect();
        info!(
            seed = self.seed,
            delivered = outcome.delivered,
            decided = outcome.decisions.len(),
            "simulation finished"
        );
        Ok(outcome)
    }
}

fn key_seed(seed: u64, id: ProcessId) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_be_bytes());
    bytes[8..12].copy_from_slice(&id.to_be_bytes());
    bytes
}

struct Network<'a> {
    simulation: &'a Simulation,
    queue: VecDeque<(ProcessId, Message)>,
    rng: ChaCha8Rng,
    outcome: Outcome,
}

impl Network<'_> {
    fn next(&mut self) -> Option<(ProcessId, Message)> {
        match self.simulation.delivery {
            Delivery::Fifo => self.queue.pop_front(),
            Delivery::Random => {
                if self.queue.is_empty() {
                    return None;
                }
                let index = self.rng.gen_range(0..self.queue.len());
                self.queue.swap_remove_back(index)
            }
        }
    }

    fn dispatch(&mut self, from: ProcessId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Decided { rank, value } => {
                    self.outcome.decisions.insert(from, (rank, value));
                }
                Action::BroadcastToAll(message) => self.send_to_all(from, message),
            }
        }
    }

    fn send_to_all(&mut self, from: ProcessId, message: Message) {
        let fault = self.simulation.faults.get(&from).cloned();

        if let (Some(Fault::Inject(value)), Message::Broadcast(broadcast)) = (&fault, &message) {
            if broadcast.step() == Step::A {
                let rival = Arc::new(Broadcast::new(
                    broadcast.rank,
                    from,
                    Proposal::A(value.clone()),
                    broadcast.certificate.iter().take(1).cloned().collect(),
                ));
                self.outcome.injected.push(rival.id());
                self.enqueue_all(from, Message::Broadcast(rival), None);
            }
        }

        self.enqueue_all(from, message, fault.as_ref());
    }

    fn enqueue_all(&mut self, from: ProcessId, message: Message, fault: Option<&Fault>) {
        self.outcome.trace.push((from, message.clone()));
        for to in self.simulation.config.members() {
            let copy = match fault {
                Some(Fault::Equivocate(value)) if to != from && to % 2 == 1 => {
                    equivocate(&message, value)
                }
                _ => message.clone(),
            };
            if self.rng.gen_bool(self.simulation.duplication) {
                self.queue.push_back((to, copy.clone()));
            }
            self.queue.push_back((to, copy));
        }
    }
}

fn equivocate(message: &Message, value: &Value) -> Message {
    let Message::Broadcast(broadcast) = message else {
        return message.clone();
    };
    let proposal = match &broadcast.proposal {
        Proposal::R(_) => Proposal::R(value.clone()),
        Proposal::A(_) => Proposal::A(value.clone()),
        Proposal::B(pair) => Proposal::B(BValue::new(pair.flag, value.clone())),
    };
    Message::Broadcast(Arc::new(Broadcast::new(
        broadcast.rank,
        broadcast.sender,
        proposal,
        broadcast.certificate.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::consensus::message::{RValue, Snapshot};

    const BUDGET: usize = 200_000;

    fn values(inputs: &[u64]) -> Vec<Value> {
        inputs.iter().copied().map(Value::from).collect()
    }

    #[test]
    fn test_scenario_majority_input_is_decided_in_rank_zero() {
        let config = Config::for_faults(1);
        let outcome = Simulation::new(config.clone(), values(&[10, 20, 20, 20]), 0)
            .with_delivery(Delivery::Fifo)
            .with_start_order(vec![1, 2, 3, 0])
            .run(BUDGET)
            .unwrap();

        assert!(outcome.all_correct_decided(&config));
        for (_, decision) in outcome.correct_decisions() {
            assert_eq!(decision, &(0, Value::from(20)));
        }

        let r_snapshots: Vec<&Snapshot> = outcome
            .trace
            .iter()
            .filter_map(|(_, message)| match message {
                Message::Response(response) if response.step() == Step::R => {
                    Some(&response.snapshot)
                }
                _ => None,
            })
            .collect();
        assert!(!r_snapshots.is_empty());
        for snapshot in r_snapshots {
            assert_eq!(snapshot, &Snapshot::R(RValue::new(0, Value::from(20))));
        }
    }

    #[test]
    fn test_scenario_undersized_certificate_is_never_answered() {
        let config = Config::for_faults(1);
        for seed in 0..5 {
            let outcome = Simulation::new(config.clone(), values(&[4, 8, 15, 16]), seed)
                .with_fault(3, Fault::Inject(Value::from(99)))
                .run(BUDGET)
                .unwrap();

            assert!(!outcome.injected.is_empty());
            for id in &outcome.injected {
                assert!(outcome.answered_by(id).is_empty());
            }
            assert!(outcome.all_correct_decided(&config));
            assert!(outcome.agreed_value().is_some());
            assert_ne!(outcome.agreed_value(), Some(&Value::from(99)));
        }
    }

    #[test]
    fn test_agreement_under_equivocation() {
        let config = Config::for_faults(1);
        for seed in 0..20 {
            let outcome = Simulation::new(config.clone(), values(&[1, 2, 3, 4]), seed)
                .with_fault(0, Fault::Equivocate(Value::from(50)))
                .run(BUDGET)
                .unwrap();

            assert!(outcome.all_correct_decided(&config), "seed {} did not terminate", seed);
            assert!(outcome.agreed_value().is_some(), "seed {} disagreed", seed);
        }
    }

    #[test]
    fn test_validity_with_silent_process() {
        let config = Config::for_faults(1);
        for seed in 0..10 {
            let outcome = Simulation::new(config.clone(), values(&[7, 7, 0, 7]), seed)
                .with_fault(2, Fault::Silent)
                .run(BUDGET)
                .unwrap();

            assert!(outcome.all_correct_decided(&config));
            assert_eq!(outcome.agreed_value(), Some(&Value::from(7)));
        }
    }

    #[test]
    fn test_termination_with_two_silent_of_seven() {
        let config = Config::for_faults(2);
        for seed in 0..3 {
            let outcome = Simulation::new(config.clone(), values(&[3, 1, 4, 1, 5, 9, 2]), seed)
                .with_fault(1, Fault::Silent)
                .with_fault(5, Fault::Silent)
                .run(1_000_000)
                .unwrap();

            assert!(outcome.all_correct_decided(&config));
            assert!(outcome.agreed_value().is_some());
        }
    }

    #[test]
    fn test_duplicated_delivery_is_answered_once() {
        let config = Config::for_faults(1);
        for seed in 0..5 {
            let outcome = Simulation::new(config.clone(), values(&[9, 3, 9, 3]), seed)
                .with_duplication(0.5)
                .run(BUDGET)
                .unwrap();

            assert!(outcome.all_correct_decided(&config));
            assert!(outcome.agreed_value().is_some());

            let mut answered = HashSet::new();
            for (from, message) in &outcome.trace {
                if let Message::Response(response) = message {
                    assert!(
                        answered.insert((*from, response.in_reply_to)),
                        "process {} answered {:?} twice",
                        from,
                        response.in_reply_to
                    );
                }
            }
        }
    }

    #[test]
    fn test_nan_duplication_means_none() {
        let config = Config::for_faults(1);
        let simulation = Simulation::new(config.clone(), values(&[4, 4, 4, 4]), 2)
            .with_duplication(f64::NAN);
        assert_eq!(simulation.duplication, 0.0);

        let outcome = simulation.run(BUDGET).unwrap();
        assert_eq!(outcome.agreed_value(), Some(&Value::from(4)));
    }

    #[test]
    fn test_signed_run_agrees() {
        let config = Config::for_faults(1);
        let outcome = Simulation::new(config.clone(), values(&[5, 6, 7, 8]), 11)
            .signed()
            .with_fault(1, Fault::Equivocate(Value::from(1)))
            .run(BUDGET)
            .unwrap();

        assert!(outcome.all_correct_decided(&config));
        assert!(outcome.agreed_value().is_some());
    }

    #[test]
    fn test_same_seed_replays_same_execution() {
        let config = Config::for_faults(1);
        let simulation = Simulation::new(config, values(&[1, 9, 1, 9]), 42);

        let first = simulation.run(BUDGET).unwrap();
        let second = simulation.run(BUDGET).unwrap();

        assert_eq!(first.delivered, second.delivered);
        assert_eq!(first.decisions, second.decisions);
        assert_eq!(first.trace.len(), second.trace.len());
    }

    #[test]
    fn test_rejects_wrong_input_count() {
        let simulation = Simulation::new(Config::for_faults(1), values(&[1]), 0);
        assert!(matches!(
            simulation.run(10),
            Err(ConfigError::InputCount { expected: 4, actual: 1 })
        ));
    }
}
