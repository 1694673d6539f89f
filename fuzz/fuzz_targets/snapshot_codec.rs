#![no_main]
use bluekey::vault::codec::RonCodec;
use bluekey::vault::ports::VaultCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let codec = RonCodec;
    if let Ok(snapshot) = codec.decode(data) {
        // Anything that decodes must encode again.
        let _ = codec.encode(&snapshot).map(|bytes| codec.decode(&bytes));
    }
});
