//! Reassembly of fragments into actions.
//!
//! A connection transmits one action at a time, so each sender has at most
//! one action in reassembly. Actions from different members reassemble
//! independently. An action is returned only once every fragment arrived in
//! order; any irregularity discards the partial buffer and the action is
//! never delivered. A head fragment from a sender whose previous action is
//! still incomplete discards that action: its tail was lost.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use gcs_proto::{ActionType, Fragment, MemberId};
use thiserror::Error;
use tracing::debug;

/// Upper bound on reassembly pre-allocation. Larger actions grow on demand.
const MAX_PREALLOC: usize = 64 * 1024;

/// A complete action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Action type
    pub act_type: ActionType,
    /// Sender-local action id
    pub act_id: u64,
    /// Complete payload
    pub payload: Bytes,
}

/// Reasons a partial action was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefragError {
    /// Continuation fragment with no action in progress
    #[error("fragment {frag_no} of action {act_id} from {sender} has no head")]
    Orphan {
        /// Sending member
        sender: MemberId,
        /// Action id
        act_id: u64,
        /// Position of the stray fragment
        frag_no: u32,
    },

    /// Fragment out of position
    #[error("action {act_id} from {sender}: expected fragment {expected}, got {got}")]
    Gap {
        /// Sending member
        sender: MemberId,
        /// Action id
        act_id: u64,
        /// Expected position
        expected: u32,
        /// Received position
        got: u32,
    },

    /// Fragments disagree with the declared action size
    #[error("action {act_id} from {sender}: declared {declared} bytes, got {actual}")]
    SizeMismatch {
        /// Sending member
        sender: MemberId,
        /// Action id
        act_id: u64,
        /// Size declared in the header
        declared: u64,
        /// Bytes received
        actual: u64,
    },

    /// Declared size exceeds the reassembly limit
    #[error("action {act_id} from {sender}: {size} bytes exceeds limit {limit}")]
    TooLarge {
        /// Sending member
        sender: MemberId,
        /// Action id
        act_id: u64,
        /// Declared size
        size: u64,
        /// Configured limit
        limit: u64,
    },
}

impl DefragError {
    /// Id of the discarded action.
    pub fn act_id(&self) -> u64 {
        match self {
            Self::Orphan { act_id, .. }
            | Self::Gap { act_id, .. }
            | Self::SizeMismatch { act_id, .. }
            | Self::TooLarge { act_id, .. } => *act_id,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    act_id: u64,
    act_type: ActionType,
    act_size: u64,
    next_frag: u32,
    buf: BytesMut,
}

/// Per-sender reassembly buffers.
#[derive(Debug)]
pub struct Defragmenter {
    in_flight: HashMap<MemberId, InFlight>,
    max_action: u64,
    superseded: Option<u64>,
}

impl Defragmenter {
    /// Default limit on a single action's size.
    pub const DEFAULT_MAX_ACTION: u64 = u32::MAX as u64;

    /// Create an empty defragmenter with the default size limit.
    pub fn new() -> Self {
        Self::with_limit(Self::DEFAULT_MAX_ACTION)
    }

    /// Create an empty defragmenter rejecting actions above `max_action`
    /// bytes.
    pub fn with_limit(max_action: u64) -> Self {
        Self { in_flight: HashMap::new(), max_action, superseded: None }
    }

    /// Feed one fragment from `sender`.
    ///
    /// Returns the complete action when `frag` was its last fragment. If the
    /// fragment abandons an earlier incomplete action of the same sender,
    /// that action's id is reported by [`Self::superseded`].
    pub fn push(&mut self, sender: &str, frag: Fragment) -> Result<Option<Reassembled>, DefragError> {
        self.superseded = None;
        let act_id = frag.header.act_id();
        let act_size = frag.header.act_size();

        if frag.is_first() {
            self.abandon(sender, act_id);

            if act_size > self.max_action {
                return Err(DefragError::TooLarge {
                    sender: sender.to_owned(),
                    act_id,
                    size: act_size,
                    limit: self.max_action,
                });
            }

            let received = frag.payload.len() as u64;
            if frag.is_last() {
                if received != act_size {
                    return Err(size_mismatch(sender, act_id, act_size, received));
                }
                return Ok(Some(Reassembled {
                    act_type: frag.header.act_type(),
                    act_id,
                    payload: frag.payload,
                }));
            }
            if received > act_size {
                return Err(size_mismatch(sender, act_id, act_size, received));
            }

            let mut buf = BytesMut::with_capacity((act_size as usize).min(MAX_PREALLOC));
            buf.extend_from_slice(&frag.payload);
            self.in_flight.insert(
                sender.to_owned(),
                InFlight { act_id, act_type: frag.header.act_type(), act_size, next_frag: 1, buf },
            );
            return Ok(None);
        }

        let frag_no = frag.header.frag_no();
        let Some(entry) = self.in_flight.get_mut(sender).filter(|e| e.act_id == act_id) else {
            // The head of this action was lost; whatever the sender had in
            // flight before it will never complete either.
            self.abandon(sender, act_id);
            return Err(DefragError::Orphan { sender: sender.to_owned(), act_id, frag_no });
        };

        if frag_no != entry.next_frag {
            let expected = entry.next_frag;
            self.in_flight.remove(sender);
            return Err(DefragError::Gap { sender: sender.to_owned(), act_id, expected, got: frag_no });
        }

        let received = (entry.buf.len() + frag.payload.len()) as u64;
        if received > entry.act_size {
            let declared = entry.act_size;
            self.in_flight.remove(sender);
            return Err(size_mismatch(sender, act_id, declared, received));
        }

        entry.buf.extend_from_slice(&frag.payload);
        entry.next_frag += 1;

        if !frag.is_last() {
            return Ok(None);
        }

        let Some(done) = self.in_flight.remove(sender) else {
            return Ok(None);
        };
        if done.buf.len() as u64 != done.act_size {
            return Err(size_mismatch(sender, act_id, done.act_size, done.buf.len() as u64));
        }

        Ok(Some(Reassembled { act_type: done.act_type, act_id, payload: done.buf.freeze() }))
    }

    /// Id of the incomplete action the last [`Self::push`] discarded because
    /// its sender moved on to another action.
    pub fn superseded(&self) -> Option<u64> {
        self.superseded
    }

    /// Discard partial actions of every sender not in `members`.
    ///
    /// Returns the number of discarded actions.
    pub fn retain_senders(&mut self, members: &[MemberId]) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|sender, _| members.contains(sender));
        before - self.in_flight.len()
    }

    /// Discard every partial action.
    pub fn clear(&mut self) -> usize {
        let discarded = self.pending();
        self.in_flight.clear();
        discarded
    }

    /// Number of partially reassembled actions.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Drop the sender's partial action unless it is `act_id` itself.
    fn abandon(&mut self, sender: &str, act_id: u64) {
        if let Some(stale) = self.in_flight.remove(sender) {
            if stale.act_id == act_id {
                debug!(sender, act_id, "restarted action discards previous partial buffer");
            } else {
                debug!(sender, stale = stale.act_id, act_id, "unfinished action abandoned");
                self.superseded = Some(stale.act_id);
            }
        }
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}

fn size_mismatch(sender: &str, act_id: u64, declared: u64, actual: u64) -> DefragError {
    DefragError::SizeMismatch { sender: sender.to_owned(), act_id, declared, actual }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use gcs_proto::Fragmenter;
    use proptest::prelude::*;

    use super::*;

    fn fragments(act_id: u64, payload: &[u8], pkt_size: usize) -> Vec<Fragment> {
        Fragmenter::new(ActionType::Data, act_id, Bytes::copy_from_slice(payload), pkt_size)
            .unwrap()
            .map(|m| Fragment::decode(m).unwrap())
            .collect()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn reassembles_in_order_fragments() {
        let data = pattern(5000);
        let mut defrag = Defragmenter::new();

        let frags = fragments(1, &data, 100);
        let last = frags.len() - 1;
        for (i, frag) in frags.into_iter().enumerate() {
            let out = defrag.push("a", frag).unwrap();
            if i < last {
                assert!(out.is_none());
            } else {
                let action = out.unwrap();
                assert_eq!(action.act_id, 1);
                assert_eq!(action.payload, Bytes::from(data.clone()));
            }
        }
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn interleaved_senders_do_not_mix() {
        let a = pattern(300);
        let b: Vec<u8> = pattern(300).into_iter().rev().collect();
        let mut defrag = Defragmenter::new();

        let mut done = Vec::new();
        for (fa, fb) in fragments(1, &a, 132).into_iter().zip(fragments(1, &b, 132)) {
            done.extend(defrag.push("a", fa).unwrap().map(|r| ("a", r.payload)));
            done.extend(defrag.push("b", fb).unwrap().map(|r| ("b", r.payload)));
        }

        assert_eq!(done, vec![("a", Bytes::from(a)), ("b", Bytes::from(b))]);
    }

    #[test]
    fn missing_fragment_discards_the_action() {
        let data = pattern(1000);
        let mut defrag = Defragmenter::new();
        let mut frags = fragments(5, &data, 132);
        frags.remove(3);

        let mut delivered = 0;
        let mut errors = 0;
        for frag in frags {
            match defrag.push("a", frag) {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => {},
                Err(_) => errors += 1,
            }
        }

        assert_eq!(delivered, 0);
        assert!(errors >= 1);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn gap_is_reported_with_positions() {
        let data = pattern(1000);
        let mut defrag = Defragmenter::new();
        let mut frags = fragments(5, &data, 132).into_iter();

        defrag.push("a", frags.next().unwrap()).unwrap();
        let skipped = frags.nth(1).unwrap();

        assert_eq!(
            defrag.push("a", skipped),
            Err(DefragError::Gap { sender: "a".into(), act_id: 5, expected: 1, got: 2 })
        );
    }

    #[test]
    fn continuation_without_head_is_orphan() {
        let data = pattern(500);
        let frags = fragments(2, &data, 132);
        let mut defrag = Defragmenter::new();

        let result = defrag.push("a", frags[1].clone());
        assert!(matches!(result, Err(DefragError::Orphan { frag_no: 1, .. })));
    }

    #[test]
    fn departed_sender_loses_partial_action() {
        let data = pattern(500);
        let mut defrag = Defragmenter::new();
        let frags = fragments(2, &data, 132);

        defrag.push("gone", frags[0].clone()).unwrap();
        defrag.push("stays", frags[0].clone()).unwrap();
        assert_eq!(defrag.pending(), 2);

        let discarded = defrag.retain_senders(&["stays".to_owned()]);
        assert_eq!(discarded, 1);
        assert_eq!(defrag.pending(), 1);

        let result = defrag.push("gone", frags[1].clone());
        assert!(matches!(result, Err(DefragError::Orphan { .. })));
    }

    #[test]
    fn oversized_action_is_rejected() {
        let data = pattern(500);
        let mut defrag = Defragmenter::with_limit(100);
        let frags = fragments(1, &data, 132);

        let result = defrag.push("a", frags[0].clone());
        assert!(matches!(result, Err(DefragError::TooLarge { size: 500, limit: 100, .. })));
    }

    #[test]
    fn restarted_action_replaces_stale_buffer() {
        let data = pattern(500);
        let mut defrag = Defragmenter::new();
        let frags = fragments(3, &data, 132);

        defrag.push("a", frags[0].clone()).unwrap();
        let mut out = None;
        for frag in frags {
            out = defrag.push("a", frag).unwrap();
        }

        assert_eq!(out.unwrap().payload, Bytes::from(data));
    }

    #[test]
    fn live_sender_losing_tails_leaves_nothing_pending() {
        let mut defrag = Defragmenter::new();
        let mut delivered = Vec::new();

        for act_id in 0..100u64 {
            let mut frags = fragments(act_id, &pattern(400), 132);
            if act_id % 2 == 0 {
                frags.pop();
            }
            for frag in frags {
                if let Some(done) = defrag.push("a", frag).unwrap() {
                    delivered.push(done.act_id);
                }
            }
        }

        assert_eq!(delivered, (0..100).filter(|id| id % 2 == 1).collect::<Vec<_>>());
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn next_head_reports_the_abandoned_action() {
        let mut defrag = Defragmenter::new();
        let first = fragments(7, &pattern(400), 132);
        let second = fragments(8, &pattern(10), 132);

        defrag.push("a", first[0].clone()).unwrap();
        assert_eq!(defrag.superseded(), None);

        let done = defrag.push("a", second[0].clone()).unwrap().unwrap();
        assert_eq!(done.act_id, 8);
        assert_eq!(defrag.superseded(), Some(7));

        // Only the push that abandoned the action reports it.
        defrag.push("a", second[0].clone()).unwrap();
        assert_eq!(defrag.superseded(), None);
    }

    #[test]
    fn headless_action_abandons_the_previous_one() {
        let mut defrag = Defragmenter::new();
        let first = fragments(1, &pattern(400), 132);
        let second = fragments(2, &pattern(400), 132);

        defrag.push("a", first[0].clone()).unwrap();
        let result = defrag.push("a", second[1].clone());

        assert!(matches!(result, Err(DefragError::Orphan { act_id: 2, .. })));
        assert_eq!(defrag.superseded(), Some(1));
        assert_eq!(defrag.pending(), 0);
    }

    /// Actions per sender, each as `(act_id, payload, fragments kept)`.
    type Stream = Vec<(u64, Vec<u8>, Vec<Option<Fragment>>)>;

    fn lossy_streams(actions: &[(usize, usize, u64)], pkt_size: usize) -> [Stream; 3] {
        let mut streams: [Stream; 3] = Default::default();
        for (act_id, &(sender, len, loss)) in actions.iter().enumerate() {
            let payload: Vec<u8> = (0..len).map(|i| (i + act_id) as u8).collect();
            let kept = fragments(act_id as u64, &payload, pkt_size)
                .into_iter()
                .enumerate()
                .map(|(i, f)| ((loss >> (i % 64)) & 0b111 != 0).then_some(f))
                .collect();
            streams[sender].push((act_id as u64, payload, kept));
        }
        streams
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Senders interleave arbitrarily but each sender's fragments keep
        /// their order. Exactly the actions that lost no fragment come out,
        /// whole, and abandoned buffers never accumulate.
        #[test]
        fn prop_lossy_streams_deliver_only_complete_actions(
            actions in prop::collection::vec((0..3usize, 0..600usize, any::<u64>()), 1..24),
            schedule in prop::collection::vec(0..3usize, 0..256),
            pkt_size in 40..200usize,
        ) {
            let streams = lossy_streams(&actions, pkt_size);
            let senders = ["a", "b", "c"];

            let mut expected = Vec::new();
            let mut queues: Vec<VecDeque<Fragment>> = Vec::new();
            for stream in &streams {
                let mut queue = VecDeque::new();
                for (act_id, payload, kept) in stream {
                    if kept.iter().all(Option::is_some) {
                        expected.push((*act_id, Bytes::from(payload.clone())));
                    }
                    queue.extend(kept.iter().flatten().cloned());
                }
                queues.push(queue);
            }

            let mut defrag = Defragmenter::new();
            let mut delivered = Vec::new();
            let mut order = schedule;
            order.extend((0..3).flat_map(|s| std::iter::repeat_n(s, queues[s].len())));

            for pick in order {
                let Some(frag) = queues[pick].pop_front() else { continue };
                if let Ok(Some(done)) = defrag.push(senders[pick], frag) {
                    delivered.push((done.act_id, done.payload));
                }
                prop_assert!(defrag.pending() <= senders.len());
            }

            delivered.sort();
            expected.sort();
            prop_assert_eq!(delivered, expected);

            defrag.retain_senders(&[]);
            prop_assert_eq!(defrag.pending(), 0);
        }
    }
}
