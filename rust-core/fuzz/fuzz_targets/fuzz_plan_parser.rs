// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the execution plan parser.
// Run with: cargo +nightly fuzz run fuzz_plan_parser
//
// Arbitrary input must either parse or be rejected with an error. A parsed
// plan must keep every cost share inside [0, 100].

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if input.len() > 64 * 1024 {
        return;
    }

    if let Ok(plan) = planscope_plan::parse(input) {
        for op in plan.flatten() {
            assert!((0.0..=100.0).contains(&op.cost_percent));
        }
        let _ = plan.render_text();
    }
});
