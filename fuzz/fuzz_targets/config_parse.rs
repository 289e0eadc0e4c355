#![no_main]

use consign_config::parse_config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(config) = parse_config(input) {
        for name in config.account_names() {
            if let Ok(account) = config.account(name) {
                assert!(account.range().size().is_some());
                assert!(account.transport() <= 9);
            }
        }
    }
});
