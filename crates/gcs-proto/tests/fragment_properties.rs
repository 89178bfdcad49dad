//! Property tests for action fragmentation.

use bytes::Bytes;
use gcs_proto::{ActionType, Fragment, FragmentHeader, Fragmenter};
use proptest::prelude::*;

proptest! {
    /// Concatenating fragment payloads in order yields the original action,
    /// and every message respects the packet size.
    #[test]
    fn prop_fragments_cover_action_exactly(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        pkt_size in (FragmentHeader::SIZE + 1)..512usize,
    ) {
        let original = Bytes::from(data);
        let fragmenter = Fragmenter::new(ActionType::Data, 11, original.clone(), pkt_size).unwrap();
        let expected_count = fragmenter.fragment_count();

        let mut joined = Vec::with_capacity(original.len());
        let mut count = 0usize;
        for msg in fragmenter {
            prop_assert!(msg.len() <= pkt_size);

            let frag = Fragment::decode(msg).unwrap();
            prop_assert_eq!(frag.header.frag_no() as usize, count);
            prop_assert_eq!(frag.header.act_size(), original.len() as u64);
            joined.extend_from_slice(&frag.payload);
            count += 1;
        }

        prop_assert_eq!(count, expected_count);
        prop_assert_eq!(Bytes::from(joined), original);
    }

    /// Decoding arbitrary bytes never panics.
    #[test]
    fn prop_decode_is_total(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Fragment::decode(Bytes::from(data));
    }
}
