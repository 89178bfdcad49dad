//! Library-generated service messages.
//!
//! These travel as SERVICE actions through the same fragmenting path as
//! application data and are never delivered to the application. Payloads are
//! CBOR so that fields can be added without a wire version bump.

use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    seqno::Seqno,
};

/// Member state broadcast after every primary view, so that all members agree
/// on the next global sequence number and configuration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    /// Backend view this report answers
    pub view_id: u64,
    /// Last global seqno this member delivered (0 if none)
    pub last_global: Seqno,
    /// Last primary configuration id this member saw (-1 if none)
    pub conf_id: i64,
}

/// Service message carried in a SERVICE action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMessage {
    /// State exchange for a new primary view
    StateReport(StateReport),
    /// Highest seqno the sender has applied locally
    LastApplied {
        /// Applied sequence number
        seqno: Seqno,
    },
}

impl ServiceMessage {
    /// Encode to CBOR.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_report_survives_cbor() {
        let msg = ServiceMessage::StateReport(StateReport {
            view_id: 4,
            last_global: 1234,
            conf_id: -1,
        });

        let bytes = msg.encode().unwrap();
        assert_eq!(ServiceMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let result = ServiceMessage::decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }
}
