#![allow(dead_code)]

use loadgate::{AdvancingSleeper, LoadLimiter, ManualClock};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

/// Limiter of `max_load` over a 10s window of 1s segments, driven by a manual clock.
pub fn manual_limiter(max_load: u64) -> (LoadLimiter, ManualClock, AdvancingSleeper) {
    let clock = ManualClock::new();
    let sleeper = AdvancingSleeper::new(clock.clone());
    let limiter = LoadLimiter::builder()
        .max_load(max_load)
        .window_size(Duration::from_secs(10))
        .segment_duration(Duration::from_secs(1))
        .clock(clock.clone())
        .sleeper(sleeper.clone())
        .build()
        .expect("valid limiter");
    (limiter, clock, sleeper)
}

/// Log sink for asserting on emitted events.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
