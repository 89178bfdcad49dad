//! Action types.
//!
//! There is a conceptual difference between messages and actions. Messages are
//! the elementary, bounded units the group transport delivers atomically.
//! Actions are what the application replicates: arbitrary-size buffers that
//! are fragmented into as many messages as needed. Ordered actions are only
//! delivered in a primary configuration, once total order of their messages is
//! established.

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::errors::ProtocolError;

/// Action type tag, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ActionType {
    /// Application action (ordered)
    Data = 0,
    /// Group-wide commit cut (ordered, library generated)
    CommitCut = 1,
    /// Request for a state snapshot
    Snapshot = 2,
    /// Reached primary configuration (library generated)
    Primary = 3,
    /// Service action, sent by the library itself
    Service = 4,
    /// Reached non-primary configuration (library generated)
    NonPrimary = 5,
    /// Error happened while receiving an action
    Error = 6,
    /// Undefined action type
    Unknown = 7,
}

impl ActionType {
    /// Whether actions of this type take part in the global sequence.
    pub fn is_ordered(self) -> bool {
        matches!(self, Self::Data | Self::CommitCut)
    }

    /// Whether an application may hand this type to `send`.
    pub fn is_sendable(self) -> bool {
        matches!(self, Self::Data | Self::Snapshot)
    }

    /// Wire representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::CommitCut),
            2 => Some(Self::Snapshot),
            3 => Some(Self::Primary),
            4 => Some(Self::Service),
            5 => Some(Self::NonPrimary),
            6 => Some(Self::Error),
            7 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl TryFrom<u8> for ActionType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        Self::from_u8(value).ok_or(ProtocolError::InvalidActionType(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_data_and_commit_cut_are_ordered() {
        let ordered: Vec<_> = (0..=7)
            .filter_map(ActionType::from_u8)
            .filter(|t| t.is_ordered())
            .collect();
        assert_eq!(ordered, vec![ActionType::Data, ActionType::CommitCut]);
    }

    #[test]
    fn unknown_byte_is_rejected() {
        assert_eq!(ActionType::try_from(8), Err(ProtocolError::InvalidActionType(8)));
    }

    #[test]
    fn application_may_send_data_and_snapshot() {
        assert!(ActionType::Data.is_sendable());
        assert!(ActionType::Snapshot.is_sendable());
        assert!(!ActionType::Primary.is_sendable());
        assert!(!ActionType::Service.is_sendable());
        assert!(!ActionType::CommitCut.is_sendable());
    }
}
