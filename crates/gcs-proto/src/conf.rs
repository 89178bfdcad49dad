//! Configuration (membership) record.

use serde::{Deserialize, Serialize};

use crate::seqno::Seqno;

/// Identifier of a group member, unique within a channel.
pub type MemberId = String;

/// Membership record delivered with PRIMARY and NON_PRIMARY actions.
///
/// Produced once per configuration transition. On a primary configuration
/// the application must (re)initialize its TO monitor at [`Self::seqno`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfRecord {
    /// Next global sequence number to be handed out
    pub seqno: Seqno,
    /// Configuration epoch, -1 for a non-primary configuration
    pub conf_id: i64,
    /// Index of this node within `members`
    pub my_idx: usize,
    /// Members of the configuration, in backend order
    pub members: Vec<MemberId>,
    /// This node's history lags the group's; it needs a state snapshot
    pub st_required: bool,
}

impl ConfRecord {
    /// Configuration id used for non-primary configurations.
    pub const NON_PRIMARY_ID: i64 = -1;

    /// Number of members in the configuration.
    pub fn memb_num(&self) -> usize {
        self.members.len()
    }

    /// Whether this record describes a primary configuration.
    pub fn is_primary(&self) -> bool {
        self.conf_id != Self::NON_PRIMARY_ID
    }

    /// This node's member id.
    pub fn my_id(&self) -> Option<&MemberId> {
        self.members.get(self.my_idx)
    }
}
