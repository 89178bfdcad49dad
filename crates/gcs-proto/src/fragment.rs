//! Action fragmentation.
//!
//! [`Fragmenter`] cuts one action into encoded messages no larger than the
//! configured packet size. [`Fragment::decode`] parses one received message.
//! Reassembly lives with the receiver state (it needs per-sender bookkeeping).

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    action_type::ActionType,
    errors::{ProtocolError, Result},
    flags::FragmentFlags,
    header::FragmentHeader,
};

/// One received fragment: validated header plus its payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Parsed header
    pub header: FragmentHeader,
    /// Payload bytes carried by this fragment
    pub payload: Bytes,
}

impl Fragment {
    /// Decode a transport message into a fragment without copying the
    /// payload.
    pub fn decode(msg: Bytes) -> Result<Self> {
        let (header, rest) = FragmentHeader::parse(&msg)?;

        let declared = header.frag_len() as usize;
        if rest.len() != declared {
            return Err(ProtocolError::LengthMismatch { declared, actual: rest.len() });
        }

        let payload = msg.slice(FragmentHeader::SIZE..);
        Ok(Self { header, payload })
    }

    /// Encode a single fragment.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FragmentHeader::SIZE + self.payload.len());
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
    }

    /// Whether this is the first fragment of its action.
    pub fn is_first(&self) -> bool {
        self.header.frag_no() == 0
    }

    /// Whether this is the final fragment of its action.
    pub fn is_last(&self) -> bool {
        self.header.flags().is_last()
    }
}

/// Iterator over the encoded fragments of one action.
///
/// Every yielded message is at most `pkt_size` bytes. A zero-length action
/// still yields exactly one (empty) fragment so that it can be delivered.
#[derive(Debug)]
pub struct Fragmenter {
    act_type: ActionType,
    act_id: u64,
    payload: Bytes,
    chunk: usize,
    offset: usize,
    frag_no: u32,
    done: bool,
}

impl Fragmenter {
    /// Prepare to fragment `payload` into messages of at most `pkt_size`
    /// bytes.
    pub fn new(act_type: ActionType, act_id: u64, payload: Bytes, pkt_size: usize) -> Result<Self> {
        let chunk = pkt_size.checked_sub(FragmentHeader::SIZE).filter(|c| *c > 0).ok_or(
            ProtocolError::PacketTooSmall { pkt_size, header: FragmentHeader::SIZE },
        )?;

        let count = payload.len().div_ceil(chunk).max(1);
        if u32::try_from(count).is_err() {
            return Err(ProtocolError::ActionTooLarge(payload.len() as u64));
        }

        Ok(Self { act_type, act_id, payload, chunk, offset: 0, frag_no: 0, done: false })
    }

    /// Number of fragments this action is cut into.
    pub fn fragment_count(&self) -> usize {
        self.payload.len().div_ceil(self.chunk).max(1)
    }

    /// Total action size in bytes.
    pub fn act_size(&self) -> usize {
        self.payload.len()
    }
}

impl Iterator for Fragmenter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }

        let end = (self.offset + self.chunk).min(self.payload.len());
        let more = end < self.payload.len();
        let flags = if more { FragmentFlags::MORE } else { FragmentFlags::empty() };

        let header = FragmentHeader::new(
            self.act_type,
            self.act_id,
            self.payload.len() as u64,
            self.frag_no,
            (end - self.offset) as u32,
            flags,
        );

        let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE + end - self.offset);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(&self.payload[self.offset..end]);

        self.offset = end;
        self.frag_no += 1;
        self.done = !more;

        Some(buf.freeze())
    }
}
