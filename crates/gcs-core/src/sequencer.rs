//! Global and local sequence number assignment.
//!
//! Owned by the delivery loop, which sees actions in the single order the
//! backend established, so assignment needs no locking.

use gcs_proto::Seqno;

/// Gapless counters for one connection.
#[derive(Debug, Clone)]
pub struct Sequencer {
    /// Next global seqno for an ordered action
    next_global: Seqno,
    /// Next local seqno for any delivered action
    next_local: Seqno,
}

impl Sequencer {
    /// Both counters start at 1.
    pub fn new() -> Self {
        Self { next_global: 1, next_local: 1 }
    }

    /// Stamp an ordered action.
    pub fn assign_ordered(&mut self) -> (Seqno, Seqno) {
        let global = self.next_global;
        self.next_global += 1;
        (global, self.assign_unordered())
    }

    /// Stamp an unordered action (local seqno only).
    pub fn assign_unordered(&mut self) -> Seqno {
        let local = self.next_local;
        self.next_local += 1;
        local
    }

    /// Restart the global sequence at `next`, as agreed by a new primary
    /// configuration. The local counter is never reset.
    pub fn reset_global(&mut self, next: Seqno) {
        self.next_global = next;
    }

    /// Global seqno that the next ordered action receives.
    pub fn next_global(&self) -> Seqno {
        self.next_global
    }

    /// Last global seqno handed out, 0 if none.
    pub fn last_global(&self) -> Seqno {
        self.next_global.saturating_sub(1)
    }

    /// Last local seqno handed out, 0 if none.
    pub fn last_local(&self) -> Seqno {
        self.next_local.saturating_sub(1)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_and_unordered_share_the_local_counter() {
        let mut seq = Sequencer::new();

        assert_eq!(seq.assign_ordered(), (1, 1));
        assert_eq!(seq.assign_unordered(), 2);
        assert_eq!(seq.assign_ordered(), (2, 3));
        assert_eq!(seq.last_global(), 2);
        assert_eq!(seq.last_local(), 3);
    }

    #[test]
    fn reset_moves_only_the_global_counter() {
        let mut seq = Sequencer::new();
        seq.assign_ordered();
        seq.assign_ordered();

        seq.reset_global(100);
        assert_eq!(seq.assign_ordered(), (100, 3));
        assert_eq!(seq.last_global(), 100);
    }
}
