#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::login7::Login7;

fuzz_target!(|data: &[u8]| {
    // Server-side LOGIN7 decoding, offsets and lengths are attacker-chosen.
    let bytes = Bytes::copy_from_slice(data);
    let _ = Login7::decode(bytes);
});
