// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

// Macros for metrics when observability is disabled
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

// Re-export macros for use in this module when observability is disabled
#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

use crate::extractor::ExtractorKind;

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "extraction_events_total",
        "Events returned by an extractor, labelled by source."
    );
    describe_histogram!(
        "extraction_duration_seconds",
        "Wall time of one extractor run, labelled by source."
    );
    describe_counter!(
        "extraction_chain_outcomes_total",
        "Per-chain extraction outcomes (cached, extracted, failed, skipped)."
    );
    describe_counter!(
        "extraction_fallbacks_total",
        "Times a source returned nothing and the next one was tried."
    );
    describe_gauge!("stored_events", "Events stored per chain after extraction.");
    describe_counter!(
        "reconciliation_unmatched_total",
        "Bridge messages missing one of their legs."
    );
}

// --- Helper functions to update metrics ---

pub fn record_extraction(source: ExtractorKind, events: usize, duration: std::time::Duration) {
    counter!("extraction_events_total", events as u64, "source" => source.as_str());
    histogram!(
        "extraction_duration_seconds",
        duration.as_secs_f64(),
        "source" => source.as_str()
    );
}

pub fn increment_chain_outcome(outcome: &'static str) {
    increment_counter!("extraction_chain_outcomes_total", "outcome" => outcome);
}

pub fn increment_fallback(from: ExtractorKind) {
    increment_counter!("extraction_fallbacks_total", "from" => from.as_str());
}

pub fn set_stored_events(chain_id: u64, count: usize) {
    gauge!("stored_events", count as f64, "chain_id" => chain_id.to_string());
}

pub fn increment_reconciliation_unmatched(reason: &'static str) {
    increment_counter!("reconciliation_unmatched_total", "reason" => reason);
}
