//! Sequence numbers.

/// Sequence number type, shared by global and local counters.
pub type Seqno = u64;

/// Illegal sequence number.
///
/// Marks an action that was never serialised: unordered actions carry it in
/// their global field, and it is never handed out by a sequencer.
pub const SEQNO_ILL: Seqno = u64::MAX;
