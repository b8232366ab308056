#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::packet::{MAX_NEGOTIATED_PACKET_SIZE, PacketHeader};

fuzz_target!(|data: &[u8]| {
    // Header decoding must reject, never panic on, any 8 bytes.
    if data.len() >= 8 {
        let mut cursor = data;
        if let Ok(header) = PacketHeader::decode(&mut cursor) {
            let _ = header.check_length(MAX_NEGOTIATED_PACKET_SIZE);
        }
    }
});
