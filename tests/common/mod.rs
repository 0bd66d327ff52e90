//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use smu_daq::types::{Sample, SessionEvent, WarningKind};
use std::time::Duration;

/// Upper bound for waiting on a session to end
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Samples in event order
pub fn samples(events: &[SessionEvent]) -> Vec<Sample> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Sample(s) => Some(*s),
            _ => None,
        })
        .collect()
}

/// Number of warnings of one kind
pub fn warning_count(events: &[SessionEvent], kind: WarningKind) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Warning(w) if w.kind == kind))
        .count()
}

/// Number of `SessionEnded` events
pub fn end_count(events: &[SessionEvent]) -> usize {
    events.iter().filter(|e| e.is_session_end()).count()
}
