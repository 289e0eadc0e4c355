#![no_main]

use consign_barcode::{Barcode, check_digit};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(barcode) = Barcode::parse(input) {
        // A parsed barcode renders back to the same text.
        assert_eq!(barcode.to_string(), input);
        if barcode.verify() {
            let expected = check_digit(barcode.from_prefix(), barcode.reference()).unwrap();
            assert_eq!(expected, barcode.check());
        }
    }
});
