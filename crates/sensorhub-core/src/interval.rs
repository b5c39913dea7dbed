//! Interval arbitration across the sessions sharing one channel.
//!
//! Every session votes an interval in milliseconds. A vote of 0 means "use the
//! hardware wakeup, no software pacing" and never wins. The effective interval
//! is the smallest positive vote, or the channel default when nobody cast one.

use std::collections::BTreeMap;

use crate::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalArbiter {
    default_ms: u32,
    votes: BTreeMap<SessionId, u32>,
}

impl IntervalArbiter {
    pub fn new(default_ms: u32) -> Self {
        Self {
            default_ms,
            votes: BTreeMap::new(),
        }
    }

    /// Record (or replace) the vote of `session`.
    pub fn vote(&mut self, session: SessionId, interval_ms: u32) {
        self.votes.insert(session, interval_ms);
    }

    /// Drop the vote of `session`. Returns `true` if it had voted.
    pub fn withdraw(&mut self, session: SessionId) -> bool {
        self.votes.remove(&session).is_some()
    }

    pub fn effective_ms(&self) -> u32 {
        self.votes
            .values()
            .copied()
            .filter(|ms| *ms > 0)
            .min()
            .unwrap_or(self.default_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_positive_vote_wins() {
        let mut arb = IntervalArbiter::new(200);
        arb.vote(1, 0);
        arb.vote(2, 50);
        arb.vote(3, 100);
        assert_eq!(arb.effective_ms(), 50);
    }

    #[test]
    fn zero_only_falls_back_to_default() {
        let mut arb = IntervalArbiter::new(200);
        arb.vote(1, 0);
        assert_eq!(arb.effective_ms(), 200);
    }

    #[test]
    fn no_votes_uses_default() {
        assert_eq!(IntervalArbiter::new(75).effective_ms(), 75);
    }

    #[test]
    fn withdraw_recomputes() {
        let mut arb = IntervalArbiter::new(200);
        arb.vote(1, 20);
        arb.vote(2, 100);
        assert!(arb.withdraw(1));
        assert_eq!(arb.effective_ms(), 100);
        assert!(!arb.withdraw(1));
        assert_eq!(arb.votes.len(), 1);
    }

    #[test]
    fn revote_replaces_previous() {
        let mut arb = IntervalArbiter::new(200);
        arb.vote(1, 20);
        arb.vote(1, 300);
        assert_eq!(arb.effective_ms(), 300);
    }
}
