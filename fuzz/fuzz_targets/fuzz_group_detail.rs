#![no_main]

use huddle_client::protocol::GroupDetail;
use libfuzzer_sys::fuzz_target;

// REST bodies go through `reqwest`'s JSON decoding, which reads bytes.
fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<GroupDetail>(data);
});
