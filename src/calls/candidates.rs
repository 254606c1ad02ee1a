use crate::types::message::IceCandidateRecord;
use std::collections::VecDeque;

/// Holds ICE candidates until they can be delivered, preserving generation
/// order.
///
/// Used in both directions: local candidates wait for the remote identity,
/// remote candidates wait for the remote description.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidateRecord>,
    open: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate back when it can be delivered right away,
    /// otherwise keeps it.
    pub fn offer(&mut self, candidate: IceCandidateRecord) -> Option<IceCandidateRecord> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Opens the queue and hands out everything held so far, oldest first.
    /// Subsequent calls return nothing.
    pub fn open(&mut self) -> Vec<IceCandidateRecord> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    /// Drops everything held, e.g. once the session has ended.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
