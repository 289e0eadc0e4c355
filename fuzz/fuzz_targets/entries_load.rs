#![no_main]

use consign_state::parse_entries;
use consign_types::split_references;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(entries) = parse_entries(input) {
        for entry in entries {
            let _ = split_references(&entry.vals.tracking_ref);
            let _ = entry.vals.package_labels();
        }
    }
});
