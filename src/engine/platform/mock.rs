//! Mock audio platform for testing without hardware.
//!
//! [`MockPlatform`] is cheap to clone; every clone shares the same simulated
//! device, so a test keeps one clone to drive the "hardware" (deliver buffers,
//! report underruns, pull the plug) while the backend owns another.
//!
//! # Example
//!
//! ```
//! use mewo_stream_backend::engine::platform::mock::{Confirmation, MockPlatform};
//!
//! let mock = MockPlatform::new();
//! mock.set_confirmation(Confirmation::Never);
//! assert_eq!(mock.open_stream_count(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    AudioPlatform, CallbackStream, DataCallback, ErrorCallback, NativeError, NativeResult,
    NativeStream, StreamCallbacks,
};
use crate::engine::clock::StreamState;
use crate::engine::config::StreamConfig;

/// Platform calls that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateBuilder,
    Open,
    Close,
    DeleteBuilder,
    Start,
    Pause,
    Stop,
    Flush,
    SetBufferSize,
}

/// How the simulated hardware confirms transition requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confirmation {
    /// The request lands directly in the target state.
    #[default]
    Immediate,
    /// The request leaves the stream in the transient state; the first
    /// wait-for-state-change poll completes it.
    OnPoll,
    /// The stream stays in the transient state forever.
    Never,
}

/// Something the simulated hardware observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    BuilderCreated(u32),
    BuilderDeleted(u32),
    Opened(u32),
    Requested(u32, MockOp),
    Closed(u32),
    RenderBegin(u32),
    RenderEnd(u32),
}

/// Properties of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub device_id: String,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub frames_per_burst: u32,
    pub buffer_size_frames: u32,
    /// Largest buffer the device accepts; bigger requests are clamped.
    pub buffer_capacity_frames: u32,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            device_id: "mock-0".to_string(),
            sample_rate: 48000,
            channel_count: 2,
            frames_per_burst: 96,
            buffer_size_frames: 192,
            buffer_capacity_frames: 4096,
        }
    }
}

#[derive(Default)]
struct Registry {
    device: Mutex<MockDevice>,
    confirmation: Mutex<Confirmation>,
    failures: Mutex<HashMap<MockOp, VecDeque<NativeError>>>,
    events: Mutex<Vec<MockEvent>>,
    current: Mutex<Option<Arc<StreamCore>>>,
    next_id: AtomicU32,
    wait_calls: AtomicUsize,
}

impl Registry {
    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    fn take_failure(&self, op: MockOp) -> NativeResult<()> {
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn confirmation(&self) -> Confirmation {
        *self.confirmation.lock()
    }

    fn current(&self) -> Option<Arc<StreamCore>> {
        self.current.lock().clone()
    }
}

/// A simulated audio platform.
#[derive(Clone, Default)]
pub struct MockPlatform {
    registry: Arc<Registry>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a platform whose streams open with the given device properties.
    pub fn with_device(device: MockDevice) -> Self {
        let platform = Self::new();
        *platform.registry.device.lock() = device;
        platform
    }

    pub fn set_confirmation(&self, confirmation: Confirmation) {
        *self.registry.confirmation.lock() = confirmation;
    }

    /// Makes the next call to `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: MockOp, error: NativeError) {
        self.registry
            .failures
            .lock()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Everything the hardware observed so far.
    pub fn events(&self) -> Vec<MockEvent> {
        self.registry.events.lock().clone()
    }

    /// Streams opened and not yet closed.
    pub fn open_stream_count(&self) -> usize {
        let events = self.registry.events.lock();
        let opened = events
            .iter()
            .filter(|e| matches!(e, MockEvent::Opened(_)))
            .count();
        let closed = events
            .iter()
            .filter(|e| matches!(e, MockEvent::Closed(_)))
            .count();
        opened.saturating_sub(closed)
    }

    /// Number of wait-for-state-change polls issued against any stream.
    pub fn wait_calls(&self) -> usize {
        self.registry.wait_calls.load(Ordering::SeqCst)
    }

    /// Id of the currently open stream.
    pub fn current_stream_id(&self) -> Option<u32> {
        self.registry.current().map(|core| core.id)
    }

    /// State of the currently open stream.
    pub fn current_state(&self) -> Option<StreamState> {
        self.registry.current().map(|core| core.phase.lock().state)
    }

    /// Buffer depth of the currently open stream.
    pub fn current_buffer_size(&self) -> Option<u32> {
        self.registry
            .current()
            .map(|core| core.buffer_size.load(Ordering::SeqCst))
    }

    /// Sets the cumulative underrun count the current stream reports.
    pub fn set_xrun_count(&self, count: u32) {
        if let Some(core) = self.registry.current() {
            core.xruns.store(count, Ordering::SeqCst);
        }
    }

    /// Invokes the data callback of the current stream on the calling thread,
    /// as the hardware would. Returns the rendered buffer, or `None` if no
    /// stream is started.
    pub fn deliver_buffer(&self, frames: usize) -> Option<Vec<i16>> {
        let core = self.registry.current()?;
        if core.phase.lock().state != StreamState::Started {
            return None;
        }

        let mut buffer = vec![0i16; frames * core.channel_count as usize];
        let mut data = core.data.lock();
        let callback = data.as_mut()?;
        let stream: &dyn CallbackStream = core.as_ref();
        self.registry.record(MockEvent::RenderBegin(core.id));
        callback(stream, buffer.as_mut_slice(), frames);
        self.registry.record(MockEvent::RenderEnd(core.id));
        Some(buffer)
    }

    /// Reports `error` through the current stream's error callback on the
    /// calling thread. Returns `false` if no stream was listening.
    pub fn inject_error(&self, error: NativeError) -> bool {
        let Some(core) = self.registry.current() else {
            return false;
        };
        if error == NativeError::Disconnected {
            core.phase.lock().state = StreamState::Disconnected;
        }
        let mut handler = core.error.lock();
        match handler.as_mut() {
            Some(callback) => {
                callback(error);
                true
            }
            None => false,
        }
    }

    /// Simulates the device being unplugged.
    pub fn disconnect(&self) -> bool {
        self.inject_error(NativeError::Disconnected)
    }
}

/// Builder handle; its id becomes the id of the stream opened from it.
pub struct MockBuilder {
    id: u32,
}

impl AudioPlatform for MockPlatform {
    type Builder = MockBuilder;
    type Stream = MockStream;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn create_builder(&self) -> NativeResult<MockBuilder> {
        self.registry.take_failure(MockOp::CreateBuilder)?;
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.registry.record(MockEvent::BuilderCreated(id));
        Ok(MockBuilder { id })
    }

    fn open_stream(
        &self,
        builder: &mut MockBuilder,
        config: &StreamConfig,
        callbacks: StreamCallbacks,
    ) -> NativeResult<MockStream> {
        self.registry.take_failure(MockOp::Open)?;

        let mut device = self.registry.device.lock().clone();
        if let Some(channels) = config.channel_count {
            device.channel_count = channels;
        }
        if let Some(rate) = config.sample_rate {
            device.sample_rate = rate;
        }
        if let Some(frames) = config.buffer_size_in_frames {
            device.buffer_size_frames =
                frames.clamp(device.frames_per_burst, device.buffer_capacity_frames);
        }

        let core = Arc::new(StreamCore {
            id: builder.id,
            registry: Arc::downgrade(&self.registry),
            phase: Mutex::new(Phase {
                state: StreamState::Open,
                pending: None,
            }),
            xruns: AtomicU32::new(0),
            buffer_size: AtomicU32::new(device.buffer_size_frames),
            frames_per_burst: device.frames_per_burst,
            buffer_capacity: device.buffer_capacity_frames,
            sample_rate: device.sample_rate,
            channel_count: device.channel_count,
            device_id: device.device_id,
            data: Mutex::new(Some(callbacks.data)),
            error: Mutex::new(Some(callbacks.error)),
        });

        *self.registry.current.lock() = Some(Arc::clone(&core));
        self.registry.record(MockEvent::Opened(builder.id));
        Ok(MockStream { core })
    }

    fn delete_builder(&self, builder: MockBuilder) -> NativeResult<()> {
        self.registry.take_failure(MockOp::DeleteBuilder)?;
        self.registry.record(MockEvent::BuilderDeleted(builder.id));
        Ok(())
    }
}

struct Phase {
    state: StreamState,
    pending: Option<StreamState>,
}

struct StreamCore {
    id: u32,
    registry: Weak<Registry>,
    phase: Mutex<Phase>,
    xruns: AtomicU32,
    buffer_size: AtomicU32,
    frames_per_burst: u32,
    buffer_capacity: u32,
    sample_rate: u32,
    channel_count: u16,
    device_id: String,
    data: Mutex<Option<DataCallback>>,
    error: Mutex<Option<ErrorCallback>>,
}

impl StreamCore {
    fn registry(&self) -> NativeResult<Arc<Registry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| NativeError::Internal("mock platform dropped".to_string()))
    }

    fn request(
        &self,
        op: MockOp,
        transient: StreamState,
        target: StreamState,
    ) -> NativeResult<()> {
        let registry = self.registry()?;
        registry.record(MockEvent::Requested(self.id, op));
        registry.take_failure(op)?;

        let mut phase = self.phase.lock();
        match phase.state {
            StreamState::Closed => return Err(NativeError::InvalidState(StreamState::Closed)),
            StreamState::Disconnected => return Err(NativeError::Disconnected),
            _ => {}
        }
        if op == MockOp::Flush
            && !matches!(
                phase.state,
                StreamState::Open | StreamState::Paused | StreamState::Stopped | StreamState::Flushed
            )
        {
            return Err(NativeError::InvalidState(phase.state));
        }

        match registry.confirmation() {
            Confirmation::Immediate => {
                phase.state = target;
                phase.pending = None;
            }
            Confirmation::OnPoll | Confirmation::Never => {
                phase.state = transient;
                phase.pending = Some(target);
            }
        }
        Ok(())
    }

    fn resize(&self, frames: u32) -> NativeResult<u32> {
        if let Some(registry) = self.registry.upgrade() {
            registry.take_failure(MockOp::SetBufferSize)?;
        }
        let applied = frames.clamp(self.frames_per_burst, self.buffer_capacity);
        self.buffer_size.store(applied, Ordering::SeqCst);
        Ok(applied)
    }
}

impl CallbackStream for StreamCore {
    fn xrun_count(&self) -> u32 {
        self.xruns.load(Ordering::SeqCst)
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32> {
        self.resize(frames)
    }
}

/// A stream opened on [`MockPlatform`].
pub struct MockStream {
    core: Arc<StreamCore>,
}

impl NativeStream for MockStream {
    fn request_start(&self) -> NativeResult<()> {
        self.core
            .request(MockOp::Start, StreamState::Starting, StreamState::Started)
    }

    fn request_pause(&self) -> NativeResult<()> {
        self.core
            .request(MockOp::Pause, StreamState::Pausing, StreamState::Paused)
    }

    fn request_stop(&self) -> NativeResult<()> {
        self.core
            .request(MockOp::Stop, StreamState::Stopping, StreamState::Stopped)
    }

    fn request_flush(&self) -> NativeResult<()> {
        self.core
            .request(MockOp::Flush, StreamState::Flushing, StreamState::Flushed)
    }

    fn state(&self) -> StreamState {
        self.core.phase.lock().state
    }

    fn wait_for_state_change(
        &self,
        input: StreamState,
        _timeout: Duration,
    ) -> NativeResult<StreamState> {
        let registry = self.core.registry()?;
        registry.wait_calls.fetch_add(1, Ordering::SeqCst);

        let mut phase = self.core.phase.lock();
        if phase.state != input {
            return Ok(phase.state);
        }
        if registry.confirmation() == Confirmation::OnPoll {
            if let Some(target) = phase.pending.take() {
                phase.state = target;
                return Ok(target);
            }
        }
        Err(NativeError::Timeout)
    }

    fn xrun_count(&self) -> u32 {
        self.core.xruns.load(Ordering::SeqCst)
    }

    fn frames_per_burst(&self) -> u32 {
        self.core.frames_per_burst
    }

    fn buffer_size_in_frames(&self) -> u32 {
        self.core.buffer_size.load(Ordering::SeqCst)
    }

    fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32> {
        self.core.resize(frames)
    }

    fn sample_rate(&self) -> u32 {
        self.core.sample_rate
    }

    fn channel_count(&self) -> u16 {
        self.core.channel_count
    }

    fn device_id(&self) -> String {
        self.core.device_id.clone()
    }

    fn close(&mut self) -> NativeResult<()> {
        let registry = self.core.registry()?;
        registry.take_failure(MockOp::Close)?;

        // Taking the callback locks waits out any callback still running.
        self.core.data.lock().take();
        self.core.error.lock().take();
        self.core.phase.lock().state = StreamState::Closed;

        let mut current = registry.current.lock();
        if current.as_ref().is_some_and(|core| core.id == self.core.id) {
            *current = None;
        }
        drop(current);

        registry.record(MockEvent::Closed(self.core.id));
        Ok(())
    }
}
