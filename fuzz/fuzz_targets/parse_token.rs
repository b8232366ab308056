#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use tds_client::{SessionState, TokenDecoder};
use tds_framer::PacketFramer;
use tds_protocol::packet::PacketType;
use tds_types::StandardRegistry;

fuzz_target!(|data: &[u8]| {
    // Drive the token decoder over one TabularResult message until it
    // finishes or fails.
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    runtime.block_on(async {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (Ok(mut framer), Ok(server)) = (
            PacketFramer::new(client, 4096),
            PacketFramer::new(server, 4096),
        ) else {
            return;
        };
        if server.send_message(PacketType::TabularResult, data).await.is_err() {
            return;
        }
        drop(server);

        let mut decoder = TokenDecoder::new(Arc::new(StandardRegistry::new()));
        let mut state = SessionState::new(4096);
        decoder.start_response();
        for _ in 0..data.len() + 1 {
            match decoder.next_event(&mut framer, &mut state).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) if decoder.is_poisoned() => break,
                Err(_) => {}
            }
        }
    });
});
