//! Read-only window snapshots.

/// Copy of a tenant's window, taken under the same exclusion as submissions.
///
/// `segments` is ordered oldest to newest; its last entry is the current segment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowStats {
    /// Load currently counted inside the trailing window.
    pub window_total: u64,
    /// Ceiling configured for the limiter.
    pub max_load: u64,
    /// Per-segment load, oldest first.
    pub segments: Vec<u64>,
}

impl WindowStats {
    /// Load that can still be accepted right now.
    pub fn headroom(&self) -> u64 {
        self.max_load.saturating_sub(self.window_total)
    }

    /// Fraction of the ceiling in use, `0.0..=1.0` (may exceed 1.0 when instances overshoot).
    pub fn utilization(&self) -> f64 {
        self.window_total as f64 / self.max_load as f64
    }
}
