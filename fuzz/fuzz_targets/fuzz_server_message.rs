#![no_main]

use huddle_client::protocol::ServerMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Frames arrive as text; anything that is not UTF-8 never reaches the decoder.
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = serde_json::from_str::<ServerMessage>(text) {
        // Whatever decodes must encode again and decode to the same value.
        let encoded = serde_json::to_string(&message).expect("decoded message must encode");
        let again: ServerMessage =
            serde_json::from_str(&encoded).expect("encoded message must decode");
        assert_eq!(again, message);
    }
});
