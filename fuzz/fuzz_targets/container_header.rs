#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((hdr, offset)) = bluekey::cryptography::primitives::parse_header(data) {
        assert!(offset <= data.len());
        let _ = hdr.fingerprint();
    }
});
