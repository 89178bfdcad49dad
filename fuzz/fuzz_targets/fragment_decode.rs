//! Arbitrary bytes must decode to a fragment or an error, never panic, and a
//! decoded fragment must re-encode to the same bytes.

#![no_main]

use bytes::{Bytes, BytesMut};
use gcs_proto::Fragment;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frag) = Fragment::decode(Bytes::copy_from_slice(data)) else {
        return;
    };

    let mut out = BytesMut::new();
    frag.encode(&mut out);
    assert_eq!(&out[..], data);
});
