use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use crate::detector::window::{HeartbeatNode, PhiParams};

type NodeMap = HashMap<String, Arc<Mutex<HeartbeatNode>>>;

/// What an ingested heartbeat did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Sequence 1 from an unknown address; a record was created
    Joined,
    /// Sequence 1 from a known address; its record was reset in place
    Restarted,
    /// Regular heartbeat appended to an existing record
    Sampled,
    /// Non-restart heartbeat from an unknown address; nothing was stored
    Dropped,
}

/// Address-keyed registry of heartbeat records.
///
/// The map itself is copy-on-write: readers clone the current `Arc` and
/// iterate a stable snapshot, writers replace it with an extended copy.
/// Only joins of new members rewrite the map. Samples and resets go through
/// the per-record mutex, so a record is never replaced once created.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: RwLock<Arc<NodeMap>>,
    window_size: usize,
    params: PhiParams,
}

impl NodeRegistry {
    pub fn new(window_size: usize, params: PhiParams) -> Self {
        Self {
            nodes: RwLock::new(Arc::new(HashMap::new())),
            window_size,
            params,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Stable view of the registry at this instant.
    pub fn snapshot(&self) -> Arc<NodeMap> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, address: &str) -> Option<Arc<Mutex<HeartbeatNode>>> {
        self.snapshot().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Apply one heartbeat with sequence `sequence` from `address`, received at `at`.
    pub fn record(&self, address: &str, sequence: u64, at: Instant) -> Ingested {
        if sequence == 1 {
            if let Some(existing) = self.get(address) {
                lock(&existing).reset(at);
                return Ingested::Restarted;
            }
            return self.join(address, at);
        }

        match self.get(address) {
            Some(node) => {
                lock(&node).add(sequence, at);
                Ingested::Sampled
            }
            None => Ingested::Dropped,
        }
    }

    fn join(&self, address: &str, at: Instant) -> Ingested {
        let mut guard = self.nodes.write().unwrap_or_else(PoisonError::into_inner);

        // Another worker may have joined the same address since the lookup.
        if let Some(existing) = guard.get(address) {
            lock(existing).reset(at);
            return Ingested::Restarted;
        }

        let mut node = HeartbeatNode::new(address, self.window_size, self.params);
        node.add(1, at);

        let mut next: NodeMap = (**guard).clone();
        next.insert(address.to_string(), Arc::new(Mutex::new(node)));
        *guard = Arc::new(next);
        Ingested::Joined
    }
}

pub(crate) fn lock(node: &Mutex<HeartbeatNode>) -> MutexGuard<'_, HeartbeatNode> {
    node.lock().unwrap_or_else(PoisonError::into_inner)
}
