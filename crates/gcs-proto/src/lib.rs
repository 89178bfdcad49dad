//! Wire format for the GCS action transport.
//!
//! Applications replicate *actions* of arbitrary size. Group communication
//! only moves *messages*, which are bounded by the network packet size. Every
//! action is therefore cut into one or more fragments, each carrying a fixed
//! 32-byte header (zero-copy binary) followed by a slice of the action
//! payload. Library-generated control traffic (state exchange, last-applied
//! reports) travels as SERVICE actions with a CBOR payload.
//!
//! # Security
//!
//! Header parsing uses compile-time verified layouts via `zerocopy`. Declared
//! lengths are checked against the bytes actually present before any slice is
//! taken.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod action_type;
pub mod conf;
pub mod errors;
pub mod flags;
pub mod fragment;
pub mod header;
pub mod seqno;
pub mod service;

pub use action_type::ActionType;
pub use conf::{ConfRecord, MemberId};
pub use errors::{ProtocolError, Result};
pub use flags::FragmentFlags;
pub use fragment::{Fragment, Fragmenter};
pub use header::FragmentHeader;
pub use seqno::{SEQNO_ILL, Seqno};
pub use service::{ServiceMessage, StateReport};
