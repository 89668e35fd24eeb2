//! Configuration for the output backend.
//!
//! Use [`BackendConfig::default()`] for the values the backend was tuned with,
//! or override individual fields:
//!
//! ```
//! use mewo_stream_backend::{BackendConfig, RecoveryConfig};
//!
//! let config = BackendConfig {
//!     recovery: RecoveryConfig {
//!         max_attempts: 10,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.recovery.max_attempts, 10);
//! ```

use std::time::Duration;

/// How the platform should trade latency against power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PerformanceMode {
    /// No preference.
    None,
    /// Larger buffers, fewer wakeups.
    PowerSaving,
    /// Smallest buffers the device supports.
    #[default]
    LowLatency,
}

/// Sample format the stream is opened with.
///
/// The render path always works on interleaved `i16`; bindings convert when the
/// device wants something else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    I16,
    F32,
}

/// Parameters a stream is opened with. Rebuilt into a fresh builder on every
/// (re)create, never changed on a live stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Picks the initial buffer depth when none is requested.
    pub performance_mode: PerformanceMode,
    /// Preferred device format; the device default is used if it is not offered.
    pub sample_format: SampleFormat,
    /// Requested channel count (`None` = device default).
    pub channel_count: Option<u16>,
    /// Requested sample rate in Hz (`None` = device default).
    pub sample_rate: Option<u32>,
    /// Requested initial buffer depth in frames (`None` = device default).
    pub buffer_size_in_frames: Option<u32>,
    /// Device to open (`None` = system default output).
    pub device_id: Option<String>,
}

/// Bounds for blocking transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Bound for a single wait-for-state-change poll.
    /// Default: 2000ms
    pub poll_timeout: Duration,
    /// Total wait before a blocking transition reports a timeout.
    /// Default: 10s
    pub max_wait: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(2000),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Retry policy for disconnect recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Restart attempts per disconnect before giving up.
    /// Default: 5
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles on each further failure.
    /// Default: 50ms
    pub initial_backoff: Duration,
    /// Upper bound for the backoff delay.
    /// Default: 2s
    pub max_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Top-level backend configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Name the host registered this backend instance under.
    pub instance_name: String,
    pub stream: StreamConfig,
    pub wait: WaitConfig,
    pub recovery: RecoveryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            instance_name: "default".to_string(),
            stream: StreamConfig::default(),
            wait: WaitConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}
