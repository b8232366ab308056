#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::prelogin::PreLogin;

fuzz_target!(|data: &[u8]| {
    // Pre-Login replies arrive before any encryption is in place.
    let bytes = Bytes::copy_from_slice(data);
    let _ = PreLogin::decode(bytes);
});
