//! Metrics module
//!
//! Prometheus counters and histograms for multipart uploads, kept in the
//! default registry and rendered in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "presign_uploads_total",
        "Total multipart uploads by outcome",
        &["status"]  // "completed", "cancelled" or "failed"
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "presign_upload_bytes_total",
        "Total bytes in completed uploads"
    ).unwrap();

    pub static ref UPLOAD_DURATION: Histogram = register_histogram!(
        "presign_upload_duration_seconds",
        "Upload duration in seconds, initiate to complete or abort",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    pub static ref UPLOAD_PARTS: Histogram = register_histogram!(
        "presign_upload_parts",
        "Number of parts per completed upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    // Part metrics
    pub static ref PART_ATTEMPTS: CounterVec = register_counter_vec!(
        "presign_part_attempts_total",
        "Part transfer attempts by outcome",
        &["outcome"]  // "success", "retryable" or "fatal"
    ).unwrap();

    // Abort metrics
    pub static ref ABORTS_TOTAL: CounterVec = register_counter_vec!(
        "presign_aborts_total",
        "Abort requests issued during cleanup",
        &["status"]
    ).unwrap();
}

/// Record a completed upload
pub fn record_upload_completed(bytes: u64, parts_count: usize, duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["completed"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
    UPLOAD_PARTS.observe(parts_count as f64);
    UPLOAD_DURATION.observe(duration_secs);
}

/// Record an upload stopped by cancellation
pub fn record_upload_cancelled(duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["cancelled"]).inc();
    UPLOAD_DURATION.observe(duration_secs);
}

/// Record a failed upload
pub fn record_upload_failed(duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["failed"]).inc();
    UPLOAD_DURATION.observe(duration_secs);
}

/// Record the outcome of one part attempt
pub fn record_part_attempt(outcome: &str) {
    PART_ATTEMPTS.with_label_values(&[outcome]).inc();
}

/// Record an abort request
pub fn record_abort(success: bool) {
    let status = if success { "success" } else { "failure" };
    ABORTS_TOTAL.with_label_values(&[status]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upload_completed() {
        record_upload_completed(1024, 2, 0.5);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_part_attempts() {
        record_part_attempt("success");
        record_part_attempt("retryable");
        record_abort(true);
    }

    #[test]
    fn test_render_contains_counters() {
        record_upload_failed(0.1);
        record_upload_cancelled(0.2);
        let text = render();
        assert!(text.contains("presign_uploads_total"));
        assert!(text.contains("status=\"failed\""));
    }
}
