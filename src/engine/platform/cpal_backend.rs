//! [`AudioPlatform`] binding over `cpal` output streams.
//!
//! A `cpal::Stream` cannot move between threads on every host, so each open
//! stream lives on its own owner thread and is driven through a command
//! channel. The owner thread publishes state changes through a condition
//! variable, which is what [`NativeStream::wait_for_state_change`] blocks on.
//!
//! cpal has no live buffer resize. Size requests are clamped to the device's
//! supported range, remembered by the platform, and applied on the next open.
//!
//! Streams open with the requested sample format when the device offers it,
//! and with a buffer sized by the requested [`PerformanceMode`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedBufferSize};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{
    AudioPlatform, CallbackStream, DataCallback, ErrorCallback, NativeError, NativeResult,
    NativeStream, StreamCallbacks,
};
use crate::engine::clock::StreamState;
use crate::engine::config::{PerformanceMode, SampleFormat as StreamFormat, StreamConfig};

/// Burst used when the device does not report a buffer range.
const DEFAULT_BURST_FRAMES: u32 = 256;
/// Largest buffer ever requested, in frames.
const MAX_BUFFER_FRAMES: u32 = 8192;

/// The default cpal host.
#[derive(Clone, Default)]
pub struct CpalPlatform {
    /// Buffer depth requested by the underrun adapter, applied on the next open.
    preferred_buffer_frames: Arc<AtomicU32>,
}

impl CpalPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolved open parameters.
pub struct CpalBuilder {
    host_id: cpal::HostId,
}

impl AudioPlatform for CpalPlatform {
    type Builder = CpalBuilder;
    type Stream = CpalStream;

    fn name(&self) -> &'static str {
        "cpal"
    }

    fn create_builder(&self) -> NativeResult<CpalBuilder> {
        let host = cpal::default_host();
        Ok(CpalBuilder { host_id: host.id() })
    }

    fn open_stream(
        &self,
        builder: &mut CpalBuilder,
        config: &StreamConfig,
        callbacks: StreamCallbacks,
    ) -> NativeResult<CpalStream> {
        let shared = Arc::new(CpalShared::new(Arc::clone(&self.preferred_buffer_frames)));
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let host_id = builder.host_id;
        let config = config.clone();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cpal-stream".to_string())
            .spawn(move || {
                run_stream(host_id, config, callbacks, thread_shared, command_rx, ready_tx)
            })
            .map_err(|e| NativeError::Internal(format!("failed to spawn stream thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CpalStream {
                shared,
                commands: command_tx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(NativeError::Internal("stream thread exited during open".to_string()))
            }
        }
    }

    fn delete_builder(&self, _builder: CpalBuilder) -> NativeResult<()> {
        Ok(())
    }
}

/// State shared between the control side, the owner thread and the cpal callbacks.
struct CpalShared {
    state: Mutex<StreamState>,
    changed: Condvar,
    xruns: AtomicU32,
    buffer_size: AtomicU32,
    frames_per_burst: AtomicU32,
    min_buffer: AtomicU32,
    max_buffer: AtomicU32,
    sample_rate: AtomicU32,
    channels: AtomicU32,
    device_id: Mutex<String>,
    preferred_buffer_frames: Arc<AtomicU32>,
}

impl CpalShared {
    fn new(preferred_buffer_frames: Arc<AtomicU32>) -> Self {
        Self {
            state: Mutex::new(StreamState::Uninitialized),
            changed: Condvar::new(),
            xruns: AtomicU32::new(0),
            buffer_size: AtomicU32::new(0),
            frames_per_burst: AtomicU32::new(DEFAULT_BURST_FRAMES),
            min_buffer: AtomicU32::new(1),
            max_buffer: AtomicU32::new(MAX_BUFFER_FRAMES),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            device_id: Mutex::new(String::new()),
            preferred_buffer_frames,
        }
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    fn get_state(&self) -> StreamState {
        *self.state.lock()
    }

    fn resize(&self, frames: u32) -> NativeResult<u32> {
        let min = self.min_buffer.load(Ordering::Relaxed);
        let max = self.max_buffer.load(Ordering::Relaxed);
        let applied = frames.clamp(min, max.max(min));
        self.buffer_size.store(applied, Ordering::Relaxed);
        self.preferred_buffer_frames.store(applied, Ordering::Relaxed);
        Ok(applied)
    }
}

impl CallbackStream for CpalShared {
    fn xrun_count(&self) -> u32 {
        self.xruns.load(Ordering::Relaxed)
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32> {
        self.resize(frames)
    }
}

enum Command {
    Play(Sender<NativeResult<()>>),
    Pause(Sender<NativeResult<()>>),
    Stop(Sender<NativeResult<()>>),
    Close,
}

/// An open cpal output stream, owned by its stream thread.
pub struct CpalStream {
    shared: Arc<CpalShared>,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn send(&self, make: impl FnOnce(Sender<NativeResult<()>>) -> Command) -> NativeResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| NativeError::InvalidState(self.shared.get_state()))?;
        reply_rx
            .recv()
            .map_err(|_| NativeError::InvalidState(self.shared.get_state()))?
    }

    fn shutdown(&mut self) -> NativeResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Close);
        thread
            .join()
            .map_err(|_| NativeError::Internal("stream thread panicked".to_string()))?;
        self.shared.set_state(StreamState::Closed);
        Ok(())
    }
}

impl NativeStream for CpalStream {
    fn request_start(&self) -> NativeResult<()> {
        self.send(Command::Play)
    }

    fn request_pause(&self) -> NativeResult<()> {
        self.send(Command::Pause)
    }

    fn request_stop(&self) -> NativeResult<()> {
        self.send(Command::Stop)
    }

    fn request_flush(&self) -> NativeResult<()> {
        // Nothing is queued on the cpal side; flushing only moves the state.
        let state = self.shared.get_state();
        match state {
            StreamState::Open
            | StreamState::Paused
            | StreamState::Stopped
            | StreamState::Flushed => {
                self.shared.set_state(StreamState::Flushing);
                self.shared.set_state(StreamState::Flushed);
                Ok(())
            }
            StreamState::Disconnected => Err(NativeError::Disconnected),
            other => Err(NativeError::InvalidState(other)),
        }
    }

    fn state(&self) -> StreamState {
        self.shared.get_state()
    }

    fn wait_for_state_change(
        &self,
        input: StreamState,
        timeout: Duration,
    ) -> NativeResult<StreamState> {
        let mut state = self.shared.state.lock();
        if *state != input {
            return Ok(*state);
        }
        let result = self
            .shared
            .changed
            .wait_while_for(&mut state, |s| *s == input, timeout);
        if result.timed_out() {
            Err(NativeError::Timeout)
        } else {
            Ok(*state)
        }
    }

    fn xrun_count(&self) -> u32 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    fn frames_per_burst(&self) -> u32 {
        self.shared.frames_per_burst.load(Ordering::Relaxed)
    }

    fn buffer_size_in_frames(&self) -> u32 {
        self.shared.buffer_size.load(Ordering::Relaxed)
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32> {
        self.shared.resize(frames)
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate.load(Ordering::Relaxed)
    }

    fn channel_count(&self) -> u16 {
        self.shared.channels.load(Ordering::Relaxed) as u16
    }

    fn device_id(&self) -> String {
        self.shared.device_id.lock().clone()
    }

    fn close(&mut self) -> NativeResult<()> {
        if self.thread.is_some() {
            self.shared.set_state(StreamState::Closing);
        }
        self.shutdown()
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_stream(
    host_id: cpal::HostId,
    config: StreamConfig,
    callbacks: StreamCallbacks,
    shared: Arc<CpalShared>,
    commands: Receiver<Command>,
    ready: Sender<NativeResult<()>>,
) {
    let stream = match build_stream(host_id, &config, callbacks, &shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    shared.set_state(StreamState::Open);
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            Command::Play(reply) => {
                let result = transition(&shared, StreamState::Starting, StreamState::Started, || {
                    stream.play().map_err(|e| NativeError::Internal(e.to_string()))
                });
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let result = transition(&shared, StreamState::Pausing, StreamState::Paused, || {
                    stream.pause().map_err(|e| NativeError::Internal(e.to_string()))
                });
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = transition(&shared, StreamState::Stopping, StreamState::Stopped, || {
                    stream.pause().map_err(|e| NativeError::Internal(e.to_string()))
                });
                let _ = reply.send(result);
            }
            Command::Close => break,
        }
    }

    // Dropping the stream joins cpal's callback thread.
    drop(stream);
}

fn transition(
    shared: &CpalShared,
    transient: StreamState,
    target: StreamState,
    apply: impl FnOnce() -> NativeResult<()>,
) -> NativeResult<()> {
    let previous = shared.get_state();
    match previous {
        StreamState::Disconnected => return Err(NativeError::Disconnected),
        StreamState::Closing | StreamState::Closed => {
            return Err(NativeError::InvalidState(previous))
        }
        _ => {}
    }
    shared.set_state(transient);
    match apply() {
        Ok(()) => {
            shared.set_state(target);
            Ok(())
        }
        Err(e) => {
            shared.set_state(previous);
            Err(e)
        }
    }
}

fn find_device(host: &cpal::Host, device_id: Option<&str>) -> NativeResult<cpal::Device> {
    match device_id {
        None => host.default_output_device().ok_or(NativeError::NoDevice),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| NativeError::Internal(e.to_string()))?
            .find(|d| d.name().map(|name| name == wanted).unwrap_or(false))
            .ok_or(NativeError::NoDevice),
    }
}

fn build_stream(
    host_id: cpal::HostId,
    config: &StreamConfig,
    callbacks: StreamCallbacks,
    shared: &Arc<CpalShared>,
) -> NativeResult<cpal::Stream> {
    let host = cpal::host_from_id(host_id).map_err(|e| NativeError::Internal(e.to_string()))?;
    let device = find_device(&host, config.device_id.as_deref())?;
    let device_id = device.name().unwrap_or_else(|_| "unknown".to_string());

    let default = device
        .default_output_config()
        .map_err(|e| NativeError::Internal(e.to_string()))?;
    let ranges = device
        .supported_output_configs()
        .map(|ranges| ranges.collect::<Vec<_>>())
        .unwrap_or_default();
    let supported = choose_config(ranges, default, config);
    let sample_format = supported.sample_format();
    let (min, max) = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } => (*min.max(&1), (*max).min(MAX_BUFFER_FRAMES)),
        SupportedBufferSize::Unknown => (1, MAX_BUFFER_FRAMES),
    };
    let max = max.max(min);
    let burst = DEFAULT_BURST_FRAMES.clamp(min, max);

    let mut stream_config: cpal::StreamConfig = supported.into();
    if let Some(channels) = config.channel_count {
        stream_config.channels = channels;
    }
    if let Some(rate) = config.sample_rate {
        stream_config.sample_rate = rate;
    }
    let requested = initial_buffer_frames(
        config.performance_mode,
        config.buffer_size_in_frames,
        shared.preferred_buffer_frames.load(Ordering::Relaxed),
        burst,
        (min, max),
    );
    stream_config.buffer_size = cpal::BufferSize::Fixed(requested);

    shared.min_buffer.store(min, Ordering::Relaxed);
    shared.max_buffer.store(max, Ordering::Relaxed);
    shared.frames_per_burst.store(burst, Ordering::Relaxed);
    shared.buffer_size.store(requested, Ordering::Relaxed);
    shared
        .sample_rate
        .store(stream_config.sample_rate, Ordering::Relaxed);
    shared
        .channels
        .store(stream_config.channels as u32, Ordering::Relaxed);
    *shared.device_id.lock() = device_id;

    let StreamCallbacks { data, error } = callbacks;
    let channels = stream_config.channels.max(1) as usize;
    let stream_res = match sample_format {
        SampleFormat::F32 => {
            build_typed::<f32>(&device, &stream_config, data, error, shared, channels)
        }
        SampleFormat::I16 => {
            build_typed::<i16>(&device, &stream_config, data, error, shared, channels)
        }
        SampleFormat::U16 => {
            build_typed::<u16>(&device, &stream_config, data, error, shared, channels)
        }
        other => {
            return Err(NativeError::Unsupported(format!(
                "sample format {other:?}"
            )))
        }
    };

    stream_res.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => NativeError::Disconnected,
        other => NativeError::Internal(other.to_string()),
    })
}

fn cpal_format(format: StreamFormat) -> SampleFormat {
    match format {
        StreamFormat::I16 => SampleFormat::I16,
        StreamFormat::F32 => SampleFormat::F32,
    }
}

/// Picks a supported configuration in the requested format, channel count and
/// rate. Falls back to the device default when none matches.
fn choose_config(
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    default: cpal::SupportedStreamConfig,
    config: &StreamConfig,
) -> cpal::SupportedStreamConfig {
    let format = cpal_format(config.sample_format);
    if default.sample_format() == format
        && config.channel_count.is_none_or(|c| c == default.channels())
        && config.sample_rate.is_none_or(|r| r == default.sample_rate())
    {
        return default;
    }

    let channels = config.channel_count.unwrap_or(default.channels());
    let rate = config.sample_rate.unwrap_or(default.sample_rate());
    let chosen = ranges
        .into_iter()
        .filter(|range| range.sample_format() == format && range.channels() == channels)
        .find_map(|range| range.try_with_sample_rate(rate));
    match chosen {
        Some(chosen) => chosen,
        None => {
            debug!(
                "No {:?} config with {} channels at {}Hz, using device default {:?}",
                format,
                channels,
                rate,
                default.sample_format()
            );
            default
        }
    }
}

/// Initial buffer depth: an explicit request wins, otherwise the performance
/// mode picks a multiple of the burst. Never below what the underrun adapter
/// already asked for.
fn initial_buffer_frames(
    mode: PerformanceMode,
    requested: Option<u32>,
    preferred: u32,
    burst: u32,
    (min, max): (u32, u32),
) -> u32 {
    let base = requested.unwrap_or(match mode {
        PerformanceMode::LowLatency => burst,
        PerformanceMode::None => burst * 2,
        PerformanceMode::PowerSaving => burst * 8,
    });
    base.max(preferred).clamp(min, max)
}

/// What the error callback does with a cpal stream error.
#[derive(Debug, PartialEq, Eq)]
enum ErrorAction {
    CountXrun,
    Report(NativeError),
}

fn classify_stream_error(err: cpal::StreamError) -> ErrorAction {
    match err {
        cpal::StreamError::BufferUnderrun => ErrorAction::CountXrun,
        // both mean the stream has to be rebuilt
        cpal::StreamError::DeviceNotAvailable | cpal::StreamError::StreamInvalidated => {
            ErrorAction::Report(NativeError::Disconnected)
        }
        cpal::StreamError::BackendSpecific { err } => {
            ErrorAction::Report(NativeError::Internal(err.description))
        }
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut data: DataCallback,
    mut error: ErrorCallback,
    shared: &Arc<CpalShared>,
    channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    // Sized once; larger device buffers are rendered in slices of this.
    let mut scratch = vec![0i16; MAX_BUFFER_FRAMES as usize * channels];
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);

    device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            let stream: &dyn CallbackStream = data_shared.as_ref();
            for chunk in out.chunks_mut(scratch.len()) {
                let rendered = &mut scratch[..chunk.len()];
                data(stream, rendered, chunk.len() / channels);
                for (sample, value) in chunk.iter_mut().zip(rendered.iter()) {
                    *sample = T::from_sample(*value);
                }
            }
        },
        move |err: cpal::StreamError| match classify_stream_error(err) {
            ErrorAction::CountXrun => {
                error_shared.xruns.fetch_add(1, Ordering::Relaxed);
            }
            ErrorAction::Report(NativeError::Disconnected) => {
                error_shared.set_state(StreamState::Disconnected);
                error(NativeError::Disconnected);
            }
            ErrorAction::Report(other) => error(other),
        },
        None,
    )
}
