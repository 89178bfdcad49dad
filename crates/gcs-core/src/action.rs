//! Actions delivered to the application.

use bytes::Bytes;
use gcs_proto::{ActionType, ConfRecord, SEQNO_ILL, Seqno};

/// An action received from the group.
///
/// Ordered variants carry both sequence numbers; unordered variants carry
/// only the local one. The receiver owns the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Application data
    Data {
        /// Action payload
        payload: Bytes,
        /// Global sequence number
        global: Seqno,
        /// Local sequence number
        local: Seqno,
    },

    /// Group-wide commit cut: every member has applied up to `cut`
    CommitCut {
        /// Lowest last-applied seqno across the configuration
        cut: Seqno,
        /// Global sequence number
        global: Seqno,
        /// Local sequence number
        local: Seqno,
    },

    /// State snapshot request
    Snapshot {
        /// Request payload
        payload: Bytes,
        /// Local sequence number
        local: Seqno,
    },

    /// Primary configuration reached
    Primary {
        /// Membership record
        conf: ConfRecord,
        /// Local sequence number
        local: Seqno,
    },

    /// Non-primary configuration reached
    NonPrimary {
        /// Membership record
        conf: ConfRecord,
        /// Local sequence number
        local: Seqno,
    },

    /// Error while receiving an action
    Error {
        /// Diagnostic
        reason: String,
        /// Local sequence number
        local: Seqno,
    },
}

impl Action {
    /// Action type tag.
    pub fn act_type(&self) -> ActionType {
        match self {
            Self::Data { .. } => ActionType::Data,
            Self::CommitCut { .. } => ActionType::CommitCut,
            Self::Snapshot { .. } => ActionType::Snapshot,
            Self::Primary { .. } => ActionType::Primary,
            Self::NonPrimary { .. } => ActionType::NonPrimary,
            Self::Error { .. } => ActionType::Error,
        }
    }

    /// Global sequence number, [`SEQNO_ILL`] for unordered actions.
    pub fn global(&self) -> Seqno {
        match self {
            Self::Data { global, .. } | Self::CommitCut { global, .. } => *global,
            _ => SEQNO_ILL,
        }
    }

    /// Local sequence number.
    pub fn local(&self) -> Seqno {
        match self {
            Self::Data { local, .. }
            | Self::CommitCut { local, .. }
            | Self::Snapshot { local, .. }
            | Self::Primary { local, .. }
            | Self::NonPrimary { local, .. }
            | Self::Error { local, .. } => *local,
        }
    }

    /// Payload size in bytes. Library-generated actions report 0.
    pub fn size(&self) -> usize {
        match self {
            Self::Data { payload, .. } | Self::Snapshot { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Payload bytes, if the action carries application data.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Data { payload, .. } | Self::Snapshot { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Membership record, if this is a configuration change.
    pub fn conf(&self) -> Option<&ConfRecord> {
        match self {
            Self::Primary { conf, .. } | Self::NonPrimary { conf, .. } => Some(conf),
            _ => None,
        }
    }
}

/// Outcome of a successful `repl`: where the action landed in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicated {
    /// Global sequence number assigned to the action
    pub global: Seqno,
    /// Local sequence number assigned to the action
    pub local: Seqno,
    /// Action size in bytes
    pub size: usize,
}

impl Replicated {
    /// Sequence numbers of a delivered own action.
    pub fn from_action(action: &Action) -> Self {
        Self { global: action.global(), local: action.local(), size: action.size() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unordered_actions_have_no_global_seqno() {
        let snapshot = Action::Snapshot { payload: Bytes::from_static(b"req"), local: 4 };
        assert_eq!(snapshot.global(), SEQNO_ILL);
        assert_eq!(snapshot.local(), 4);
        assert_eq!(snapshot.size(), 3);
        assert!(!snapshot.act_type().is_ordered());
    }

    #[test]
    fn ordered_actions_expose_both_seqnos() {
        let data = Action::Data { payload: Bytes::from_static(b"a1"), global: 10, local: 12 };
        assert_eq!(data.global(), 10);
        assert_eq!(data.local(), 12);
        assert_eq!(Replicated::from_action(&data), Replicated { global: 10, local: 12, size: 2 });
    }
}
