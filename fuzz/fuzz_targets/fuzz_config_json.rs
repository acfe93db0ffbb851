//! Fuzz target: experiment configuration parser
//!
//! Feeds arbitrary text to `ExperimentConfig::from_json` and verifies:
//! - No panics under arbitrary input
//! - Anything accepted also passes `validate()` and parses again after
//!   being serialized
//!
//! cargo fuzz run fuzz_config_json

#![no_main]

use libfuzzer_sys::fuzz_target;
use replifactory::config::ExperimentConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = ExperimentConfig::from_json(text) {
        assert!(config.validate().is_ok());
        let json = serde_json::to_string(&config).expect("serialize accepted config");
        let again = ExperimentConfig::from_json(&json).expect("re-parse accepted config");
        assert_eq!(again.cultures.len(), config.cultures.len());
    }
});
