//! Low-latency audio output backend.
//!
//! [`OutputManager`] owns a single callback-driven output stream on an
//! [`AudioPlatform`], drives it through its start/pause/stop/flush lifecycle,
//! grows its buffer when the hardware reports underruns, and restarts it on a
//! worker thread when the device disconnects. Hosts reach it through the
//! [`AudioBackend`] trait and feed it audio through [`RenderEngine`].

pub mod engine;

pub use engine::clock::{Clock, StreamState};
pub use engine::config::{
    BackendConfig, PerformanceMode, RecoveryConfig, SampleFormat, StreamConfig, WaitConfig,
};
pub use engine::engine::AudioEngine;
pub use engine::error::{NativeError, Result, StreamError};
pub use engine::output::backend_slot::BackendSlot;
pub use engine::output::output_manager::{OutputManager, StreamStats};
pub use engine::output::transition::{Transition, TransitionMode};
pub use engine::output::{AudioBackend, RenderEngine};
pub use engine::platform::cpal_backend::CpalPlatform;
pub use engine::platform::{AudioPlatform, NativeStream};
