#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::token::EnvChange;

fuzz_target!(|data: &[u8]| {
    // EnvChange tokens carry database, transaction, packet size and routing.
    let mut bytes = Bytes::copy_from_slice(data);
    if let Ok(env) = EnvChange::decode(&mut bytes) {
        let _ = env.new_packet_size();
        let _ = env.transaction_descriptor();
        let _ = env.routing_target();
        let _ = env.new_collation();
    }
});
