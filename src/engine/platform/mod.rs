//! The native audio capability set the backend drives.
//!
//! Everything above this module works against these traits only. A binding
//! implements [`AudioPlatform`] (builder + open) and [`NativeStream`]
//! (transition requests, waits, live queries); the data and error callbacks it
//! receives in [`StreamCallbacks`] are already typed closures, so no binding has
//! to round-trip an untyped user-data pointer.
//!
//! ```text
//!  control thread           audio thread              notification thread
//!  ──────────────           ────────────              ───────────────────
//!  NativeStream::request_*  StreamCallbacks::data     StreamCallbacks::error
//!  wait_for_state_change      (&dyn CallbackStream)     (NativeError)
//! ```

pub mod cpal_backend;
pub mod mock;

use std::time::Duration;

use crate::engine::clock::StreamState;
use crate::engine::config::StreamConfig;
pub use crate::engine::error::{NativeError, NativeResult};

/// What the data callback tells the hardware after each buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCallbackResult {
    Continue,
    Stop,
}

/// The slice of a stream the data callback may touch from the audio thread.
///
/// Both calls must be wait-free on the binding side.
pub trait CallbackStream {
    /// Cumulative underruns since the stream was opened.
    fn xrun_count(&self) -> u32;

    /// Requests a new buffer depth. Returns the size actually applied, which
    /// may be clamped by the hardware.
    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32>;
}

/// Data-ready callback: fill `buffer` (interleaved, `frames * channels`
/// samples) and report whether to keep going.
pub type DataCallback =
    Box<dyn FnMut(&dyn CallbackStream, &mut [i16], usize) -> DataCallbackResult + Send>;

/// Error callback, invoked on a platform-owned thread.
pub type ErrorCallback = Box<dyn FnMut(NativeError) + Send>;

/// Callback entry points wired into a stream when it is opened.
pub struct StreamCallbacks {
    pub data: DataCallback,
    pub error: ErrorCallback,
}

/// A platform that can build and open output streams.
pub trait AudioPlatform: Send + Sync + 'static {
    /// Builder allocated before each open and deleted after each close.
    type Builder: Send + 'static;
    /// An open native stream.
    type Stream: NativeStream;

    /// Short name of the binding (e.g. "cpal", "mock").
    fn name(&self) -> &'static str;

    fn create_builder(&self) -> NativeResult<Self::Builder>;

    /// Opens a stream from `builder`, wiring `callbacks` into it.
    fn open_stream(
        &self,
        builder: &mut Self::Builder,
        config: &StreamConfig,
        callbacks: StreamCallbacks,
    ) -> NativeResult<Self::Stream>;

    fn delete_builder(&self, builder: Self::Builder) -> NativeResult<()>;
}

/// An open native output stream.
///
/// Transition requests return as soon as the hardware accepted them; the
/// stream reports the resulting state asynchronously through [`state`] and
/// [`wait_for_state_change`].
///
/// [`state`]: NativeStream::state
/// [`wait_for_state_change`]: NativeStream::wait_for_state_change
pub trait NativeStream: Send + 'static {
    fn request_start(&self) -> NativeResult<()>;
    fn request_pause(&self) -> NativeResult<()>;
    fn request_stop(&self) -> NativeResult<()>;
    fn request_flush(&self) -> NativeResult<()>;

    /// Current state as last reported by the hardware.
    fn state(&self) -> StreamState;

    /// Blocks until the state differs from `input` or `timeout` elapses.
    ///
    /// Returns the new state, or [`NativeError::Timeout`] if nothing changed.
    fn wait_for_state_change(
        &self,
        input: StreamState,
        timeout: Duration,
    ) -> NativeResult<StreamState>;

    /// Cumulative underruns since the stream was opened.
    fn xrun_count(&self) -> u32;

    /// Minimal buffer-size increment the hardware works in.
    fn frames_per_burst(&self) -> u32;

    fn buffer_size_in_frames(&self) -> u32;

    /// Requests a new buffer depth; returns the size actually applied.
    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32>;

    fn sample_rate(&self) -> u32;

    fn channel_count(&self) -> u16;

    fn device_id(&self) -> String;

    /// Closes the stream. After this returns no callback for this stream is
    /// running or will run again.
    fn close(&mut self) -> NativeResult<()>;
}
