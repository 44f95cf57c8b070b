//! Outbox pass over queued messages.
//!
//! Ready messages are transmitted in ascending local id order, which is the
//! order the user composed them. A pass visits each id at most once:
//! 1. `next()` - take the next id; it becomes in flight
//! 2. `ack()` - the server confirmed it
//! 3. `nack()` - transmission failed; it stays Ready for a later pass
//!
//! When the session drops mid-pass the caller calls `halt()` and the
//! untried ids are reported as remaining.

use std::collections::{HashSet, VecDeque};
use tidings_sync_types::DbId;

/// Result of a finished (or halted) outbox pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Ids confirmed by the server, in send order.
    pub sent: Vec<DbId>,
    /// Ids whose transmission failed.
    pub failed: Vec<DbId>,
    /// Ids never attempted because the pass halted.
    pub remaining: Vec<DbId>,
}

impl FlushReport {
    /// True when every queued id was confirmed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.remaining.is_empty()
    }
}

/// One ordered pass over queued message ids.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<DbId>,
    in_flight: Option<DbId>,
    sent: Vec<DbId>,
    failed: Vec<DbId>,
    halted: bool,
}

impl Outbox {
    /// Build a pass from queued ids. Order and duplicates in the input do
    /// not matter.
    pub fn from_queued(ids: impl IntoIterator<Item = DbId>) -> Self {
        let mut seen = HashSet::new();
        let mut ids: Vec<DbId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        ids.sort();
        Self {
            queue: ids.into(),
            ..Self::default()
        }
    }

    /// Take the next id to transmit.
    ///
    /// Returns `None` when the pass is done, halted, or an id is still in
    /// flight.
    pub fn next(&mut self) -> Option<DbId> {
        if self.halted || self.in_flight.is_some() {
            return None;
        }
        let id = self.queue.pop_front()?;
        self.in_flight = Some(id);
        Some(id)
    }

    /// The in-flight id was confirmed.
    pub fn ack(&mut self, id: DbId) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
            self.sent.push(id);
        }
    }

    /// The in-flight id failed. It is not retried within this pass.
    pub fn nack(&mut self, id: DbId) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
            self.failed.push(id);
        }
    }

    /// Stop the pass; untried ids stay queued for the next one.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Check if the pass was halted.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Ids not yet attempted.
    pub fn remaining(&self) -> Vec<DbId> {
        self.queue.iter().copied().collect()
    }

    /// Number of ids not yet attempted.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if every id has been attempted.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Finish the pass.
    pub fn into_report(self) -> FlushReport {
        let mut failed = self.failed;
        // An id still in flight never got an answer.
        failed.extend(self.in_flight);
        FlushReport {
            sent: self.sent,
            failed,
            remaining: self.queue.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[i64]) -> Vec<DbId> {
        values.iter().map(|v| DbId::new(*v)).collect()
    }

    #[test]
    fn yields_in_ascending_order() {
        let mut outbox = Outbox::from_queued(ids(&[3, 1, 2]));
        let mut order = Vec::new();
        while let Some(id) = outbox.next() {
            order.push(id);
            outbox.ack(id);
        }
        assert_eq!(order, ids(&[1, 2, 3]));
        assert!(outbox.into_report().is_complete());
    }

    #[test]
    fn duplicates_are_visited_once() {
        let mut outbox = Outbox::from_queued(ids(&[5, 5, 4]));
        assert_eq!(outbox.len(), 2);
        while let Some(id) = outbox.next() {
            outbox.ack(id);
        }
        assert_eq!(outbox.into_report().sent, ids(&[4, 5]));
    }

    #[test]
    fn next_waits_for_in_flight() {
        let mut outbox = Outbox::from_queued(ids(&[1, 2]));
        assert_eq!(outbox.next(), Some(DbId::new(1)));
        assert_eq!(outbox.next(), None);
        outbox.ack(DbId::new(1));
        assert_eq!(outbox.next(), Some(DbId::new(2)));
    }

    #[test]
    fn failure_continues_pass() {
        let mut outbox = Outbox::from_queued(ids(&[1, 2]));
        let first = outbox.next().unwrap();
        outbox.nack(first);
        let second = outbox.next().unwrap();
        outbox.ack(second);

        let report = outbox.into_report();
        assert_eq!(report.failed, ids(&[1]));
        assert_eq!(report.sent, ids(&[2]));
        assert!(!report.is_complete());
    }

    #[test]
    fn halt_leaves_rest_remaining() {
        let mut outbox = Outbox::from_queued(ids(&[1, 2, 3]));
        let first = outbox.next().unwrap();
        outbox.nack(first);
        outbox.halt();

        assert!(outbox.is_halted());
        assert_eq!(outbox.next(), None);
        assert_eq!(outbox.remaining(), ids(&[2, 3]));

        let report = outbox.into_report();
        assert_eq!(report.failed, ids(&[1]));
        assert_eq!(report.remaining, ids(&[2, 3]));
    }

    #[test]
    fn ack_for_other_id_is_ignored() {
        let mut outbox = Outbox::from_queued(ids(&[1]));
        outbox.next();
        outbox.ack(DbId::new(9));
        assert_eq!(outbox.next(), None);
        assert_eq!(outbox.into_report().failed, ids(&[1]));
    }

    #[test]
    fn empty_pass() {
        let mut outbox = Outbox::from_queued(Vec::new());
        assert!(outbox.is_empty());
        assert_eq!(outbox.next(), None);
        assert!(outbox.into_report().is_complete());
    }
}
