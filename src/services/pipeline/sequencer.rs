use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::services::emit::EventBus;
use crate::services::event::{BlockEvent, Chain};

/// Per-chain emission ordering.
///
/// Workers complete out of order, but downstream must observe events in the
/// order the deduplicator accepted them. Every accepted event takes a ticket
/// at admission; completed events are held until every earlier ticket has
/// either emitted or been abandoned (failed, dropped, or timed out).
pub struct EmissionSequencer {
    chains: Mutex<HashMap<Chain, ChainSequence>>,
}

#[derive(Default)]
struct ChainSequence {
    next_ticket: u64,
    next_emit: u64,
    /// Completed events waiting on an earlier ticket; None marks a hole
    pending: BTreeMap<u64, Option<BlockEvent>>,
}

impl EmissionSequencer {
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Take the next ticket for the chain; called at admission time while
    /// the dedup outcome is fresh
    pub fn assign(&self, chain: Chain) -> u64 {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        let seq = chains.entry(chain).or_default();
        let ticket = seq.next_ticket;
        seq.next_ticket += 1;
        ticket
    }

    /// Hand over a completed event; publishes it plus any consecutive
    /// successors that were waiting behind it
    pub fn emit(&self, chain: Chain, ticket: u64, event: BlockEvent, bus: &EventBus) {
        let ready = self.collect_ready(chain, ticket, Some(event));
        for event in ready {
            bus.publish(event);
        }
    }

    /// Give the ticket up so later events are not held behind a permanent gap
    pub fn abandon(&self, chain: Chain, ticket: u64, bus: &EventBus) {
        let ready = self.collect_ready(chain, ticket, None);
        for event in ready {
            bus.publish(event);
        }
    }

    fn collect_ready(
        &self,
        chain: Chain,
        ticket: u64,
        event: Option<BlockEvent>,
    ) -> Vec<BlockEvent> {
        let mut chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        let seq = chains.entry(chain).or_default();
        seq.pending.insert(ticket, event);

        let mut ready = Vec::new();
        while let Some(slot) = seq.pending.remove(&seq.next_emit) {
            if let Some(event) = slot {
                ready.push(event);
            }
            seq.next_emit += 1;
        }
        ready
    }

    /// Completed-but-held event count, for diagnostics
    pub fn pending_len(&self, chain: Chain) -> usize {
        let chains = self.chains.lock().unwrap_or_else(|e| e.into_inner());
        chains.get(&chain).map(|s| s.pending.len()).unwrap_or(0)
    }
}

impl Default for EmissionSequencer {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSequencer = Arc<EmissionSequencer>;
