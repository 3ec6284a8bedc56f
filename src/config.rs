//! Validated window configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Preferred number of segments chosen automatically.
pub const DEFAULT_SEGMENT_COUNT: u64 = 20;

/// Fewest segments accepted from automatic segmentation. With fewer, load leaves the
/// window in large steps and the limiter drifts toward a fixed window.
pub const MIN_SEGMENT_COUNT: u64 = 10;

/// Most segments automatic segmentation may allocate per tenant.
pub const MAX_SEGMENT_COUNT: u64 = 4096;

/// Immutable, validated parameters of a limiter window.
///
/// Time is tracked in whole milliseconds. The segment duration always divides the
/// window evenly, so `segment_count * segment_duration == window_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    max_load: u64,
    window_ms: u64,
    segment_ms: u64,
    segment_count: usize,
}

impl WindowConfig {
    /// Create a config with validation.
    ///
    /// Without `segment_duration` the window is split into the largest number of equal
    /// segments not exceeding [`DEFAULT_SEGMENT_COUNT`]; when that is too coarse, into
    /// finer segments (see [`MIN_SEGMENT_COUNT`] and [`MAX_SEGMENT_COUNT`]).
    ///
    /// # Examples
    /// ```
    /// use loadgate::WindowConfig;
    /// use std::time::Duration;
    /// let cfg = WindowConfig::new(1000, Duration::from_secs(10), None).unwrap();
    /// assert_eq!(cfg.segment_count(), 20);
    /// assert_eq!(cfg.segment_duration(), Duration::from_millis(500));
    /// ```
    pub fn new(
        max_load: u64,
        window_size: Duration,
        segment_duration: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        if max_load == 0 {
            return Err(ConfigError::ZeroMaxLoad);
        }
        let window_ms = u64::try_from(window_size.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 || Duration::from_millis(window_ms) != window_size {
            return Err(ConfigError::InvalidWindowSize(window_size));
        }

        let segment_ms = match segment_duration {
            Some(segment) => {
                let segment_ms = u64::try_from(segment.as_millis()).unwrap_or(u64::MAX);
                let exact = Duration::from_millis(segment_ms) == segment;
                if segment_ms == 0 || !exact || segment_ms > window_ms || window_ms % segment_ms != 0
                {
                    return Err(ConfigError::InvalidSegmentDuration {
                        segment,
                        window: window_size,
                    });
                }
                segment_ms
            }
            None => window_ms / default_segment_count(window_ms, window_size)?,
        };

        let segment_count = usize::try_from(window_ms / segment_ms)
            .map_err(|_| ConfigError::InvalidSegmentDuration {
                segment: Duration::from_millis(segment_ms),
                window: window_size,
            })?;

        Ok(Self { max_load, window_ms, segment_ms, segment_count })
    }

    /// Ceiling for the cumulative load inside any trailing window.
    pub fn max_load(&self) -> u64 {
        self.max_load
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_ms)
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub(crate) fn segment_millis(&self) -> u64 {
        self.segment_ms
    }
}

/// Largest count up to [`DEFAULT_SEGMENT_COUNT`] dividing the window, unless that is below
/// [`MIN_SEGMENT_COUNT`]; then the smallest divisor from [`DEFAULT_SEGMENT_COUNT`] up to
/// [`MAX_SEGMENT_COUNT`]. Windows shorter than the minimum use 1ms segments.
fn default_segment_count(window_ms: u64, window_size: Duration) -> Result<u64, ConfigError> {
    let divides = |n: &u64| window_ms % n == 0;
    let preferred = (1..=DEFAULT_SEGMENT_COUNT.min(window_ms)).rev().find(divides).unwrap_or(1);
    if preferred >= MIN_SEGMENT_COUNT.min(window_ms) {
        return Ok(preferred);
    }
    (DEFAULT_SEGMENT_COUNT..=MAX_SEGMENT_COUNT.min(window_ms))
        .find(divides)
        .ok_or(ConfigError::NoEvenSegmentation(window_size))
}
