use std::collections::BTreeMap;

use super::message::{BValue, Broadcast, BroadcastId, Proposal, RValue, Rank, Snapshot, Step, Value};

/*
    Registers only ever grow towards "greater":

        R     the single greatest (rank, value) delivered in the rank
        A[i]  the two greatest distinct values delivered in rank i
        B[i]  the greatest value delivered with flag = true, and the
              greatest delivered with flag = false

    Each held value remembers the broadcast that put it there, which is
    what a response hands out as justification.
*/

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Entry<T> {
    pub value: T,
    pub justification: BroadcastId,
}

impl<T> Entry<T> {
    fn new(value: T, justification: BroadcastId) -> Self {
        Entry {
            value,
            justification,
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct RegisterR {
    held: Option<Entry<RValue>>,
}

impl RegisterR {
    /// Replaces the held value iff `candidate` is strictly greater.
    pub fn update(&mut self, candidate: RValue, justification: BroadcastId) -> bool {
        if matches!(&self.held, Some(held) if held.value >= candidate) {
            return false;
        }
        self.held = Some(Entry::new(candidate, justification));
        true
    }

    pub fn get(&self) -> Option<&Entry<RValue>> {
        self.held.as_ref()
    }

    pub fn snapshot(&self) -> Option<(Snapshot, Vec<BroadcastId>)> {
        self.held
            .as_ref()
            .map(|held| (Snapshot::R(held.value.clone()), vec![held.justification]))
    }
}

/// The two greatest distinct values seen, greatest first.
#[derive(Clone, Debug)]
pub struct TopTwo<T> {
    slots: [Option<T>; 2],
}

impl<T> Default for TopTwo<T> {
    fn default() -> Self {
        TopTwo {
            slots: [None, None],
        }
    }
}

impl<T> TopTwo<T> {
    /// Inserts keyed by `key`, evicting the smallest when a third distinct
    /// key arrives. Equal keys are the same candidate whatever they carry.
    pub fn insert_by<K: Ord>(&mut self, item: T, key: impl Fn(&T) -> &K) -> bool {
        let candidate = key(&item);
        if self.iter().any(|held| key(held) == candidate) {
            return false;
        }

        match &self.slots {
            [None, _] => {
                self.slots[0] = Some(item);
            }
            [Some(first), None] => {
                if candidate > key(first) {
                    self.slots[1] = self.slots[0].take();
                    self.slots[0] = Some(item);
                } else {
                    self.slots[1] = Some(item);
                }
            }
            [Some(first), Some(second)] => {
                if candidate > key(first) {
                    self.slots[1] = self.slots[0].take();
                    self.slots[0] = Some(item);
                } else if candidate > key(second) {
                    self.slots[1] = Some(item);
                } else {
                    return false;
                }
            }
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots[0].is_none()
    }

    pub fn first(&self) -> Option<&T> {
        self.slots[0].as_ref()
    }
}

impl<T: Ord> TopTwo<T> {
    pub fn insert(&mut self, item: T) -> bool {
        self.insert_by(item, |held| held)
    }
}

#[derive(Clone, Default, Debug)]
pub struct RegisterA {
    held: TopTwo<Entry<Value>>,
}

impl RegisterA {
    pub fn update(&mut self, candidate: Value, justification: BroadcastId) -> bool {
        self.held
            .insert_by(Entry::new(candidate, justification), |entry| &entry.value)
    }

    pub fn values(&self) -> Vec<Value> {
        self.held.iter().map(|entry| entry.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn snapshot(&self) -> Option<(Snapshot, Vec<BroadcastId>)> {
        if self.held.is_empty() {
            return None;
        }
        let justifications = self.held.iter().map(|entry| entry.justification).collect();
        Some((Snapshot::A(self.values()), justifications))
    }
}

#[derive(Clone, Default, Debug)]
pub struct RegisterB {
    truthy: Option<Entry<Value>>,
    falsy: Option<Entry<Value>>,
}

impl RegisterB {
    pub fn update(&mut self, candidate: BValue, justification: BroadcastId) -> bool {
        let slot = if candidate.flag {
            &mut self.truthy
        } else {
            &mut self.falsy
        };
        if matches!(slot.as_ref(), Some(held) if held.value >= candidate.value) {
            return false;
        }
        *slot = Some(Entry::new(candidate.value, justification));
        true
    }

    pub fn get(&self, flag: bool) -> Option<&Value> {
        let slot = if flag { &self.truthy } else { &self.falsy };
        slot.as_ref().map(|entry| &entry.value)
    }

    pub fn pairs(&self) -> Vec<BValue> {
        self.entries()
            .map(|(flag, entry)| BValue::new(flag, entry.value.clone()))
            .collect()
    }

    fn entries(&self) -> impl Iterator<Item = (bool, &Entry<Value>)> {
        let truthy = self.truthy.as_ref().map(|entry| (true, entry));
        let falsy = self.falsy.as_ref().map(|entry| (false, entry));
        truthy.into_iter().chain(falsy)
    }

    pub fn snapshot(&self) -> Option<(Snapshot, Vec<BroadcastId>)> {
        if self.truthy.is_none() && self.falsy.is_none() {
            return None;
        }
        let justifications = self.entries().map(|(_, entry)| entry.justification).collect();
        Some((Snapshot::B(self.pairs()), justifications))
    }
}

/// Per-rank registers of one process.
///
/// Old ranks are kept (answers for them are still owed to slower peers)
/// until the retention policy prunes them.
#[derive(Default, Debug)]
pub struct Registers {
    r: BTreeMap<Rank, RegisterR>,
    a: BTreeMap<Rank, RegisterA>,
    b: BTreeMap<Rank, RegisterB>,
}

impl Registers {
    pub fn new() -> Self {
        Registers::default()
    }

    /// Folds a delivered broadcast into the register of its rank and step.
    pub fn apply(&mut self, broadcast: &Broadcast, id: BroadcastId) -> bool {
        let rank = broadcast.rank;
        match &broadcast.proposal {
            Proposal::R(value) => self
                .r
                .entry(rank)
                .or_default()
                .update(RValue::new(rank, value.clone()), id),
            Proposal::A(value) => self.a.entry(rank).or_default().update(value.clone(), id),
            Proposal::B(pair) => self.b.entry(rank).or_default().update(pair.clone(), id),
        }
    }

    pub fn snapshot(&self, rank: Rank, step: Step) -> Option<(Snapshot, Vec<BroadcastId>)> {
        match step {
            Step::R => self.r.get(&rank).and_then(RegisterR::snapshot),
            Step::A => self.a.get(&rank).and_then(RegisterA::snapshot),
            Step::B => self.b.get(&rank).and_then(RegisterB::snapshot),
        }
    }

    pub fn r(&self, rank: Rank) -> Option<&RegisterR> {
        self.r.get(&rank)
    }

    pub fn a(&self, rank: Rank) -> Option<&RegisterA> {
        self.a.get(&rank)
    }

    pub fn b(&self, rank: Rank) -> Option<&RegisterB> {
        self.b.get(&rank)
    }

    pub fn prune_below(&mut self, rank: Rank) {
        self.r = self.r.split_off(&rank);
        self.a = self.a.split_off(&rank);
        self.b = self.b.split_off(&rank);
    }
}
