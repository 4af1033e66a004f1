//! Upload progress accounting

use std::sync::Arc;

/// Context passed to the progress sink with every update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressInfo {
    pub part_number: u32,
    pub num_parts: u64,
    pub part_size: u64,
    /// 1-based attempt number for the current part
    pub attempt: u32,
}

/// Receives `(bytes_sent, total_bytes, info)`
pub type ProgressSink = Arc<dyn Fn(u64, u64, &ProgressInfo) + Send + Sync>;

/// Tracks bytes sent across the whole session.
///
/// Each attempt reports a monotonically increasing `loaded` count starting
/// from zero. Only bytes beyond the furthest point any attempt of the
/// current part has reached are added to `bytes_sent`, so a retry that
/// re-sends a part from byte 0 does not count those bytes twice.
pub struct ProgressTracker {
    total_bytes: u64,
    bytes_sent: u64,
    per_part_loaded: u64,
    part_high_water: u64,
    sink: Option<ProgressSink>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, sink: Option<ProgressSink>) -> Self {
        Self {
            total_bytes,
            bytes_sent: 0,
            per_part_loaded: 0,
            part_high_water: 0,
            sink,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Cumulative bytes sent, never above `total_bytes`
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes acknowledged in the current attempt
    pub fn per_part_loaded(&self) -> u64 {
        self.per_part_loaded
    }

    pub fn begin_part(&mut self) {
        self.per_part_loaded = 0;
        self.part_high_water = 0;
    }

    pub fn begin_attempt(&mut self) {
        self.per_part_loaded = 0;
    }

    /// Record the transport's `loaded` count for the current attempt
    pub fn on_loaded(&mut self, loaded: u64, info: &ProgressInfo) {
        if loaded <= self.per_part_loaded {
            return;
        }
        self.per_part_loaded = loaded;

        if loaded <= self.part_high_water {
            return;
        }
        let delta = loaded - self.part_high_water;
        self.part_high_water = loaded;
        self.bytes_sent = (self.bytes_sent + delta).min(self.total_bytes);

        if let Some(sink) = &self.sink {
            sink(self.bytes_sent, self.total_bytes, info);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_bytes", &self.total_bytes)
            .field("bytes_sent", &self.bytes_sent)
            .field("per_part_loaded", &self.per_part_loaded)
            .finish()
    }
}
