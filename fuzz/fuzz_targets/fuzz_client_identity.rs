//! Fuzz target for the parsers that see client-controlled input.
//!
//! Forwarded-for values, block-list targets, request paths and stored column
//! values all arrive from outside. None of the parsers may panic.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_client_identity
//! cargo +nightly fuzz run fuzz_client_identity -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use wellness_gateway::RouteClass;
use wellness_gateway::middleware::ip::{CidrRange, parse_client_addr};
use wellness_gateway::models::{
    ColumnEnum, LanguageCode, QuestionTable, ReportReason, ReportStatus,
};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // A parsed address must fall inside its own single-host range
    if let Some(ip) = parse_client_addr(s) {
        let host = CidrRange::parse(&ip.to_string()).expect("parsed address is a valid host range");
        assert!(host.contains(&ip));
    }

    if let Some(range) = CidrRange::parse(s) {
        assert!(range.contains(&range.network()));
    }

    let _ = RouteClass::classify(s);

    let _ = LanguageCode::from_column(Some(s));
    let _ = QuestionTable::from_column(Some(s));
    let _ = ReportReason::from_column(Some(s));
    let _ = ReportStatus::from_column(Some(s));
});
