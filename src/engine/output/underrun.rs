//! Underrun Adapter: the body of the data-ready callback.
//!
//! Everything here runs on the audio thread. State is atomics only, and nothing
//! logs: adaptations are counted and [`UnderrunMonitor::take_report`] hands
//! them to the control side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::engine::clock::Clock;
use crate::engine::output::RenderEngine;
use crate::engine::platform::{CallbackStream, DataCallbackResult, NativeError};

/// What a single underrun check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnderrunOutcome {
    /// No new underruns.
    Quiet,
    /// New underruns; the buffer grew by one burst (or up to the hardware limit).
    Grew { from: u32, to: u32 },
    /// New underruns, but the hardware refused the larger buffer.
    Rejected { requested: u32, error: NativeError },
}

/// Snapshot of the adapter's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnderrunSnapshot {
    pub underrun_count: u32,
    pub previous_underrun_count: u32,
    pub buffer_size_frames: u32,
    pub frames_per_burst: u32,
}

/// Adaptations made since the last report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderrunReport {
    pub grown: u32,
    pub rejected: u32,
    /// Size asked for by the most recent rejected request.
    pub last_rejected_frames: u32,
    pub buffer_size_frames: u32,
}

/// Tracks hardware underruns and grows the buffer to absorb them.
#[derive(Debug, Default)]
pub struct UnderrunMonitor {
    underrun_count: AtomicU32,
    previous_underrun_count: AtomicU32,
    buffer_size_frames: AtomicU32,
    frames_per_burst: AtomicU32,
    unreported_grown: AtomicU32,
    unreported_rejected: AtomicU32,
    last_rejected_frames: AtomicU32,
}

impl UnderrunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zeroes the counters and seeds the sizes. Called on every stream create.
    pub fn reset(&self, buffer_size_frames: u32, frames_per_burst: u32) {
        self.underrun_count.store(0, Ordering::Relaxed);
        self.previous_underrun_count.store(0, Ordering::Relaxed);
        self.buffer_size_frames
            .store(buffer_size_frames, Ordering::Relaxed);
        self.frames_per_burst
            .store(frames_per_burst, Ordering::Relaxed);
        self.unreported_grown.store(0, Ordering::Relaxed);
        self.unreported_rejected.store(0, Ordering::Relaxed);
        self.last_rejected_frames.store(0, Ordering::Relaxed);
    }

    /// Compares the stream's xrun count with the previous snapshot and grows
    /// the buffer by one burst if it moved.
    ///
    /// The snapshot trails by one step: `previous` takes the old count, not
    /// the one just read.
    pub fn check(&self, stream: &dyn CallbackStream) -> UnderrunOutcome {
        let observed = stream.xrun_count();
        if observed <= self.previous_underrun_count.load(Ordering::Relaxed) {
            return UnderrunOutcome::Quiet;
        }

        let old_size = self.buffer_size_frames.load(Ordering::Relaxed);
        let old_count = self.underrun_count.swap(observed, Ordering::Relaxed);
        self.previous_underrun_count
            .store(old_count, Ordering::Relaxed);

        let requested = old_size.saturating_add(self.frames_per_burst.load(Ordering::Relaxed));
        match stream.set_buffer_size_in_frames(requested) {
            Ok(applied) => {
                self.buffer_size_frames.store(applied, Ordering::Relaxed);
                self.unreported_grown.fetch_add(1, Ordering::Relaxed);
                UnderrunOutcome::Grew {
                    from: old_size,
                    to: applied,
                }
            }
            Err(error) => {
                self.last_rejected_frames.store(requested, Ordering::Relaxed);
                self.unreported_rejected.fetch_add(1, Ordering::Relaxed);
                UnderrunOutcome::Rejected { requested, error }
            }
        }
    }

    /// Drains the adaptations counted since the previous call. `None` if there
    /// were none.
    pub fn take_report(&self) -> Option<UnderrunReport> {
        let grown = self.unreported_grown.swap(0, Ordering::Relaxed);
        let rejected = self.unreported_rejected.swap(0, Ordering::Relaxed);
        if grown == 0 && rejected == 0 {
            return None;
        }
        Some(UnderrunReport {
            grown,
            rejected,
            last_rejected_frames: self.last_rejected_frames.load(Ordering::Relaxed),
            buffer_size_frames: self.buffer_size_frames.load(Ordering::Relaxed),
        })
    }

    pub fn snapshot(&self) -> UnderrunSnapshot {
        UnderrunSnapshot {
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            previous_underrun_count: self.previous_underrun_count.load(Ordering::Relaxed),
            buffer_size_frames: self.buffer_size_frames.load(Ordering::Relaxed),
            frames_per_burst: self.frames_per_burst.load(Ordering::Relaxed),
        }
    }

    pub fn buffer_size_frames(&self) -> u32 {
        self.buffer_size_frames.load(Ordering::Relaxed)
    }
}

/// State captured by the data callback of every stream the owner opens.
pub struct RenderPath {
    engine: Arc<dyn RenderEngine>,
    clock: Arc<Clock>,
    underruns: UnderrunMonitor,
}

impl RenderPath {
    pub fn new(engine: Arc<dyn RenderEngine>, clock: Arc<Clock>) -> Self {
        Self {
            engine,
            clock,
            underruns: UnderrunMonitor::new(),
        }
    }

    /// Renders one buffer, counts it, and adapts to new underruns.
    pub fn on_audio_ready(
        &self,
        stream: &dyn CallbackStream,
        buffer: &mut [i16],
        frames: usize,
    ) -> DataCallbackResult {
        self.engine.render_audio(buffer, frames);
        self.clock.add_processed_frames(frames as u64);
        self.underruns.check(stream);
        DataCallbackResult::Continue
    }

    pub fn engine(&self) -> &Arc<dyn RenderEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn underruns(&self) -> &UnderrunMonitor {
        &self.underruns
    }
}
