//! Feed arbitrary message sequences from a handful of senders into the
//! defragmenter. Every reassembled action must match its declared size, and
//! no sender ever holds more than one partial action.

#![no_main]

use bytes::Bytes;
use gcs_core::defrag::Defragmenter;
use gcs_proto::Fragment;
use libfuzzer_sys::fuzz_target;

const SENDERS: [&str; 3] = ["a", "b", "c"];

fuzz_target!(|data: &[u8]| {
    let mut defrag = Defragmenter::with_limit(1 << 20);

    // Each message: sender byte, length byte, then that many bytes.
    let mut rest = data;
    while let [sender, len, tail @ ..] = rest {
        let len = usize::from(*len).min(tail.len());
        let (msg, next) = tail.split_at(len);
        rest = next;

        let sender = SENDERS[usize::from(*sender) % SENDERS.len()];
        let Ok(frag) = Fragment::decode(Bytes::copy_from_slice(msg)) else {
            continue;
        };
        let declared = frag.header.act_size();

        if let Ok(Some(done)) = defrag.push(sender, frag) {
            assert_eq!(done.payload.len() as u64, declared);
        }
        assert!(defrag.pending() <= SENDERS.len());
    }

    defrag.retain_senders(&[]);
    assert_eq!(defrag.pending(), 0);
});
