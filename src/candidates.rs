use std::collections::HashMap;

use crate::connection::IceCandidate;

/// Candidates held per participant before any are dropped.
pub const MAX_PENDING_PER_PEER: usize = 64;

/// Remote candidates that arrived before their peer's remote description.
///
/// Keyed by participant id, including ids with no link yet: a candidate can
/// overtake the join or offer that introduces its sender.
#[derive(Debug)]
pub struct CandidateBuffer {
    queues: HashMap<String, Vec<IceCandidate>>,
    limit: usize,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_PER_PEER)
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            limit,
        }
    }

    /// Queues `candidate` and returns the queue length, or `None` if the
    /// participant's queue is full and the candidate was dropped.
    pub fn enqueue(&mut self, participant_id: &str, candidate: IceCandidate) -> Option<usize> {
        let queue = self.queues.entry(participant_id.to_string()).or_default();
        if queue.len() >= self.limit {
            return None;
        }
        queue.push(candidate);
        Some(queue.len())
    }

    /// Removes and returns the queue in arrival order.
    pub fn drain(&mut self, participant_id: &str) -> Vec<IceCandidate> {
        self.queues.remove(participant_id).unwrap_or_default()
    }

    pub fn discard(&mut self, participant_id: &str) {
        self.queues.remove(participant_id);
    }

    pub fn pending(&self, participant_id: &str) -> usize {
        self.queues.get(participant_id).map_or(0, Vec::len)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.queues.contains_key(participant_id)
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
