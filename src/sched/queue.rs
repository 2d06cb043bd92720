//! Instance arena and run queues
//!
//! Instances live in an arena and are referenced by index; queue
//! membership is explicit data on the instance rather than intrusive
//! links, so "not in any list" is simply `None`.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::instance::ScriptInstance;

/// Arena handle of a script instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inst#{}", self.0)
    }
}

/// Which run queue an instance sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunQueueId {
    /// Fresh work, serviced in bursts.
    Start,
    /// Yielded mid-handler, lower priority than Start.
    Yield,
    /// Sleeping until a deadline.
    Sleep,
}

/// Arena of live instances with index reuse.
#[derive(Debug, Default)]
pub struct InstanceArena {
    slots: Vec<Option<Arc<ScriptInstance>>>,
    free: Vec<u32>,
}

impl InstanceArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance, reusing a free slot when available.
    pub fn insert(&mut self, inst: Arc<ScriptInstance>) -> InstanceId {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(inst);
            InstanceId(index)
        } else {
            self.slots.push(Some(inst));
            InstanceId((self.slots.len() - 1) as u32)
        }
    }

    /// Fetch a live instance.
    pub fn get(&self, id: InstanceId) -> Option<Arc<ScriptInstance>> {
        self.slots.get(id.0 as usize)?.clone()
    }

    /// Remove an instance, freeing its slot.
    pub fn remove(&mut self, id: InstanceId) -> Option<Arc<ScriptInstance>> {
        let slot = self.slots.get_mut(id.0 as usize)?;
        let inst = slot.take()?;
        self.free.push(id.0);
        Some(inst)
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live instances with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &Arc<ScriptInstance>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inst| (InstanceId(i as u32), inst)))
    }
}

/// The three run queues, guarded by one scheduler-level lock.
#[derive(Debug, Default)]
pub struct RunQueues {
    start: VecDeque<InstanceId>,
    yielded: VecDeque<InstanceId>,
    sleeping: Vec<InstanceId>,
}

impl RunQueues {
    /// Empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push onto a queue.
    pub fn push(&mut self, queue: RunQueueId, id: InstanceId) {
        match queue {
            RunQueueId::Start => self.start.push_back(id),
            RunQueueId::Yield => self.yielded.push_back(id),
            RunQueueId::Sleep => self.sleeping.push(id),
        }
    }

    /// Pop the next Start entry.
    pub fn pop_start(&mut self) -> Option<InstanceId> {
        self.start.pop_front()
    }

    /// Pop the next Yield entry.
    pub fn pop_yield(&mut self) -> Option<InstanceId> {
        self.yielded.pop_front()
    }

    /// Remove a specific id from a queue, if present.
    pub fn unlink(&mut self, queue: RunQueueId, id: InstanceId) {
        match queue {
            RunQueueId::Start => self.start.retain(|&x| x != id),
            RunQueueId::Yield => self.yielded.retain(|&x| x != id),
            RunQueueId::Sleep => self.sleeping.retain(|&x| x != id),
        }
    }

    /// Sleeping ids, for the timer scan.
    pub fn sleeping(&self) -> &[InstanceId] {
        &self.sleeping
    }

    /// Pending Start + Yield work.
    pub fn runnable_len(&self) -> usize {
        self.start.len() + self.yielded.len()
    }
}
