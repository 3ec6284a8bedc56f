//! Segmented sliding-window counter.
//!
//! The window is a ring of `segment_count` buckets, each covering one segment of time.
//! A segment is identified by its absolute index `floor(now_ms / segment_ms)`; it lives
//! in ring slot `index % segment_count`. The window at time `now` is made of the current
//! segment and the `segment_count - 1` before it.
//!
//! Rollover is lazy: buckets are zeroed only when an operation moves the current
//! segment past them. There is no background timer.
//!
//! Invariants:
//! - `total` always equals the sum of all buckets.
//! - The current segment index never decreases.
//! - All access happens under the tenant's exclusion (see [`crate::sync`]).

use crate::config::WindowConfig;
use std::time::Duration;

/// Per-tenant rolling load counter.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentedWindow {
    segment_ms: u64,
    segments: Vec<u64>,
    current: Option<u64>,
    total: u64,
}

impl SegmentedWindow {
    /// Empty window shaped by `config`.
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            segment_ms: config.segment_millis(),
            segments: vec![0; config.segment_count()],
            current: None,
            total: 0,
        }
    }

    /// Whether `self` is consistent and segmented exactly like `reference`.
    ///
    /// State loaded from a shared store written by an instance with a different
    /// configuration fails this check and must be discarded.
    pub fn same_layout(&self, reference: &SegmentedWindow) -> bool {
        self.segment_ms == reference.segment_ms
            && self.segments.len() == reference.segments.len()
            && self.segments.iter().sum::<u64>() == self.total
    }

    /// Roll the current segment forward to the one containing `now_ms`.
    ///
    /// Every bucket passed over is zeroed and its load subtracted from the total. A `now_ms`
    /// that falls in the current segment, or before it, changes nothing.
    pub fn advance(&mut self, now_ms: u64) {
        let target = now_ms / self.segment_ms;
        let Some(current) = self.current else {
            self.current = Some(target);
            return;
        };
        if target <= current {
            return;
        }

        let steps = target - current;
        if steps >= self.segments.len() as u64 {
            self.segments.iter_mut().for_each(|load| *load = 0);
            self.total = 0;
        } else {
            for index in current + 1..=target {
                let slot = self.slot(index);
                self.total = self.total.saturating_sub(self.segments[slot]);
                self.segments[slot] = 0;
            }
        }
        tracing::trace!(
            target: "loadgate::window",
            from = current,
            to = target,
            total = self.total,
            "window advanced"
        );
        self.current = Some(target);
    }

    /// Load currently inside the window, after rolling forward to `now_ms`.
    pub fn peek(&mut self, now_ms: u64) -> u64 {
        self.advance(now_ms);
        self.total
    }

    /// Record `amount` in the segment containing `now_ms`. No limit is enforced here.
    pub fn add(&mut self, amount: u64, now_ms: u64) {
        self.advance(now_ms);
        let Some(current) = self.current else {
            return;
        };
        let slot = self.slot(current);
        self.segments[slot] = self.segments[slot].saturating_add(amount);
        self.total = self.total.saturating_add(amount);
    }

    /// Shortest delay after which `requested` fits under `max_load`, assuming no other
    /// load is added meanwhile.
    ///
    /// Returns `None` when `requested > max_load`, since no amount of waiting helps, and
    /// `Some(Duration::ZERO)` when it already fits. Otherwise segments are scanned oldest
    /// first; a segment with absolute index `s` leaves the window at `(s + count) *
    /// segment`, and the first such instant at which the freed load covers the shortfall
    /// is returned. Resubmitting exactly then is accepted.
    pub fn estimate_retry_delay(
        &mut self,
        now_ms: u64,
        requested: u64,
        max_load: u64,
    ) -> Option<Duration> {
        if requested > max_load {
            return None;
        }
        self.advance(now_ms);
        let headroom = max_load.saturating_sub(self.total);
        if requested <= headroom {
            return Some(Duration::ZERO);
        }
        let needed = requested - headroom;
        let current = self.current?;

        let mut freed = 0u64;
        for offset in 1..=self.segments.len() as u64 {
            // The oldest segment still inside the window shares its slot with the next one.
            let leaves_at = current + offset;
            freed = freed.saturating_add(self.segments[self.slot(leaves_at)]);
            if freed >= needed {
                let at_ms = leaves_at.saturating_mul(self.segment_ms);
                return Some(Duration::from_millis(at_ms.saturating_sub(now_ms)));
            }
        }
        None
    }

    /// Cached sum of all segments, without rolling forward.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Segment loads ordered oldest to newest; the last entry is the current segment.
    pub fn segments(&self) -> Vec<u64> {
        let len = self.segments.len() as u64;
        match self.current {
            Some(current) => {
                (1..=len).map(|offset| self.segments[self.slot(current + offset)]).collect()
            }
            None => self.segments.clone(),
        }
    }

    /// Forget all recorded load.
    pub fn reset(&mut self) {
        self.segments.iter_mut().for_each(|load| *load = 0);
        self.current = None;
        self.total = 0;
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.segments.len() as u64) as usize
    }
}
