#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_client::browser::parse_instances;

fuzz_target!(|data: &[u8]| {
    let _ = parse_instances(data);
});
