use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Lifecycle state of a native output stream, as reported by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum StreamState {
    #[default]
    Uninitialized = 0,
    Open = 1,
    Starting = 2,
    Started = 3,
    Pausing = 4,
    Paused = 5,
    Stopping = 6,
    Stopped = 7,
    Flushing = 8,
    Flushed = 9,
    Closing = 10,
    Closed = 11,
    Disconnected = 12,
}

impl From<u8> for StreamState {
    fn from(value: u8) -> Self {
        match value {
            1 => StreamState::Open,
            2 => StreamState::Starting,
            3 => StreamState::Started,
            4 => StreamState::Pausing,
            5 => StreamState::Paused,
            6 => StreamState::Stopping,
            7 => StreamState::Stopped,
            8 => StreamState::Flushing,
            9 => StreamState::Flushed,
            10 => StreamState::Closing,
            11 => StreamState::Closed,
            12 => StreamState::Disconnected,
            _ => StreamState::Uninitialized,
        }
    }
}

/// The Clock is the lock-free bookkeeping shared between the control thread
/// and the audio callback: frames rendered, and the last stream state and
/// format reported by the hardware.
///
/// The state here is observational. It mirrors hardware replies and is never
/// consulted to refuse a transition.
pub struct Clock {
    /// Frames rendered since the backend was constructed.
    processed_frames: AtomicU64,
    /// Last reported stream state (stored as u8 for atomicity).
    state: AtomicU8,
    /// Sample rate of the current stream.
    sample_rate: AtomicU32,
    /// Channel count of the current stream.
    channels: AtomicU8,
    /// Whether a stream handle is held.
    stream_open: AtomicBool,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            processed_frames: AtomicU64::new(0),
            state: AtomicU8::new(StreamState::Uninitialized as u8),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU8::new(0),
            stream_open: AtomicBool::new(false),
        }
    }

    /// Advances the processed frame count. Called from the audio callback.
    pub fn add_processed_frames(&self, frames: u64) {
        self.processed_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn processed_frames(&self) -> u64 {
        self.processed_frames.load(Ordering::Relaxed)
    }

    /// Returns the processed frame count converted to seconds of audio.
    pub fn processed_secs(&self) -> f64 {
        let rate = self.get_sample_rate() as f64;
        if rate > 0.0 {
            self.processed_frames() as f64 / rate
        } else {
            0.0
        }
    }

    pub fn get_state(&self) -> StreamState {
        StreamState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_format(&self, sample_rate: u32, channels: u16) {
        self.sample_rate.store(sample_rate, Ordering::SeqCst);
        self.channels.store(channels.min(u8::MAX as u16) as u8, Ordering::SeqCst);
    }

    pub fn get_sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn get_channels(&self) -> u16 {
        self.channels.load(Ordering::Relaxed) as u16
    }

    /// Mirrors whether a stream handle is held, readable without the owner lock.
    pub fn set_stream_open(&self, open: bool) {
        self.stream_open.store(open, Ordering::Release);
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_open.load(Ordering::Acquire)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
