// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for query text masking and truncation.
// Run with: cargo +nightly fuzz run fuzz_mask_literals

#![no_main]

use libfuzzer_sys::fuzz_target;
use planscope_service::sanitize::{mask_literals, truncate_text};

fuzz_target!(|data: &[u8]| {
    if let Ok(sql) = std::str::from_utf8(data) {
        let masked = mask_literals(sql);
        let (text, _) = truncate_text(&masked, 64);
        assert!(text.chars().count() <= 64);
    }
});
