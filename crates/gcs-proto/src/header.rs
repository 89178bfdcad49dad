//! Fixed-size fragment header.
//!
//! ```text
//!  0       4   5   6   7   8               16              24      28      32
//!  ┌───────┬───┬───┬───┬───┬───────────────┬───────────────┬───────┬───────┐
//!  │ magic │ver│typ│flg│rsv│    act_id     │   act_size    │frag_no│frag_ln│
//!  └───────┴───┴───┴───┴───┴───────────────┴───────────────┴───────┴───────┘
//! ```
//!
//! All multi-byte integers are big-endian.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U32, U64},
};

use crate::{
    action_type::ActionType,
    errors::{ProtocolError, Result},
    flags::FragmentFlags,
};

/// Header prepended to every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FragmentHeader {
    magic: U32<BigEndian>,
    version: u8,
    act_type: u8,
    flags: u8,
    reserved: u8,
    act_id: U64<BigEndian>,
    act_size: U64<BigEndian>,
    frag_no: U32<BigEndian>,
    frag_len: U32<BigEndian>,
}

impl FragmentHeader {
    /// Encoded header size in bytes.
    pub const SIZE: usize = 32;

    /// "GCS1"
    pub const MAGIC: u32 = 0x4743_5331;

    /// Current wire version.
    pub const VERSION: u8 = 1;

    /// Build a header for one fragment of an action.
    pub fn new(
        act_type: ActionType,
        act_id: u64,
        act_size: u64,
        frag_no: u32,
        frag_len: u32,
        flags: FragmentFlags,
    ) -> Self {
        Self {
            magic: U32::new(Self::MAGIC),
            version: Self::VERSION,
            act_type: act_type.to_u8(),
            flags: flags.bits(),
            reserved: 0,
            act_id: U64::new(act_id),
            act_size: U64::new(act_size),
            frag_no: U32::new(frag_no),
            frag_len: U32::new(frag_len),
        }
    }

    /// Parse and validate a header from the front of `bytes`.
    ///
    /// Returns the header and the bytes following it.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
        let (header, rest) = Self::read_from_prefix(bytes).map_err(|_| {
            ProtocolError::MessageTooShort { expected: Self::SIZE, actual: bytes.len() }
        })?;

        if header.magic.get() != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic { found: header.magic.get() });
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }
        ActionType::try_from(header.act_type)?;

        Ok((header, rest))
    }

    /// Raw header bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Action type of the action this fragment belongs to.
    pub fn act_type(&self) -> ActionType {
        ActionType::from_u8(self.act_type).unwrap_or(ActionType::Unknown)
    }

    /// Fragment flags. Unknown bits are dropped.
    pub fn flags(&self) -> FragmentFlags {
        FragmentFlags::from_bits_truncate(self.flags)
    }

    /// Sender-local action identifier.
    pub fn act_id(&self) -> u64 {
        self.act_id.get()
    }

    /// Total size of the action in bytes.
    pub fn act_size(&self) -> u64 {
        self.act_size.get()
    }

    /// Position of this fragment within its action, starting at 0.
    pub fn frag_no(&self) -> u32 {
        self.frag_no.get()
    }

    /// Number of payload bytes following the header.
    pub fn frag_len(&self) -> u32 {
        self.frag_len.get()
    }
}
