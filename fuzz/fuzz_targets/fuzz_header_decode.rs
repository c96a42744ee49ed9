#![no_main]
use flashxlat::bat::BatEntry;
use flashxlat::header::UnitHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = UnitHeader::from_bytes(data) {
        // Anything accepted must survive a re-encode
        let encoded = header.to_bytes();
        let again = UnitHeader::from_bytes(&encoded).expect("re-encoded header rejected");
        assert_eq!(again.to_bytes(), encoded);
    }

    for chunk in data.chunks_exact(4) {
        let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        for bits in 9..=15 {
            let _ = BatEntry::decode(raw, bits).is_live();
        }
    }
});
