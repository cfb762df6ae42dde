use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{MirrorError, Result};

const FPS_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// One unit of mirroring work, repeated by [`run`].
pub trait Cycle {
    fn cycle(&mut self) -> Result<()>;
}

/// Cooperative stop request, shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Sleep after every cycle
    pub interval: Duration,
    /// Stop after this many cycles
    pub max_frames: Option<u64>,
    /// Consecutive failed cycles tolerated before giving up, 0 for no limit
    pub max_consecutive_failures: u32,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(25),
            max_frames: None,
            max_consecutive_failures: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Cycles that presented a frame
    pub frames: u64,
    /// Cycles that failed and were skipped
    pub skipped: u64,
}

impl LoopStats {
    pub fn cycles(&self) -> u64 {
        self.frames + self.skipped
    }
}

/// Repeat `mirror.cycle()` at a fixed cadence until `stop` is set, the
/// frame limit is reached, or too many cycles fail in a row.
///
/// A failed cycle leaves the secondary display showing the previous frame.
pub fn run<M: Cycle>(mirror: &mut M, options: &LoopOptions, stop: &StopFlag) -> Result<LoopStats> {
    let mut stats = LoopStats::default();
    let mut failures = 0u32;
    let mut report_start = Instant::now();
    let mut report_frames = 0u64;

    while !stop.is_stopped() {
        match mirror.cycle() {
            Ok(()) => {
                stats.frames += 1;
                report_frames += 1;
                failures = 0;
            }
            Err(e) => {
                stats.skipped += 1;
                failures += 1;
                warn!("Skipping frame: {}", e);
                if options.max_consecutive_failures > 0
                    && failures >= options.max_consecutive_failures
                {
                    return Err(MirrorError::TooManyFailures {
                        count: failures,
                        last: Box::new(e),
                    });
                }
            }
        }

        if options.max_frames.is_some_and(|max| stats.cycles() >= max) {
            break;
        }

        let elapsed = report_start.elapsed();
        if elapsed >= FPS_REPORT_INTERVAL {
            debug!(
                "{:.1} fps ({} skipped so far)",
                report_frames as f64 / elapsed.as_secs_f64(),
                stats.skipped
            );
            report_start = Instant::now();
            report_frames = 0;
        }

        std::thread::sleep(options.interval);
    }

    Ok(stats)
}
