//! Fuzz target for candidate line parsing
//!
//! Tests that arbitrary text never panics the parser and that accepted lines
//! survive a print/parse cycle.

#![no_main]

use icelink_agent::Candidate;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(candidate) = Candidate::parse(line) {
        let reparsed = Candidate::parse(&candidate.to_text()).expect("printed candidate must parse");
        assert_eq!(reparsed, candidate);
    }
});
