//! Fragment flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Per-fragment flags stored in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FragmentFlags: u8 {
        /// More fragments of the same action follow this one
        const MORE = 0b0000_0001;
    }
}

impl FragmentFlags {
    /// Whether this is the final fragment of its action.
    pub fn is_last(self) -> bool {
        !self.contains(Self::MORE)
    }
}
