//! Transition Driver: start/pause/stop/flush requests, blocking waits and the
//! composite teardown and restart sequences built from them.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::engine::clock::{Clock, StreamState};
use crate::engine::config::WaitConfig;
use crate::engine::error::{Result, StreamError};
use crate::engine::output::stream_owner::StreamOwner;
use crate::engine::platform::{AudioPlatform, NativeError, NativeResult, NativeStream};

/// A state change the driver can request from the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Pause,
    Stop,
    Flush,
}

impl Transition {
    /// State the hardware reports once the request has completed.
    pub fn target(self) -> StreamState {
        match self {
            Transition::Start => StreamState::Started,
            Transition::Pause => StreamState::Paused,
            Transition::Stop => StreamState::Stopped,
            Transition::Flush => StreamState::Flushed,
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Pause => "pause",
            Transition::Stop => "stop",
            Transition::Flush => "flush",
        }
    }

    fn request<S: NativeStream>(self, stream: &S) -> NativeResult<()> {
        match self {
            Transition::Start => stream.request_start(),
            Transition::Pause => stream.request_pause(),
            Transition::Stop => stream.request_stop(),
            Transition::Flush => stream.request_flush(),
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Whether a transition waits for the hardware to confirm the target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// Polls `stream` until it reports `target`.
///
/// Each poll uses the last observed state as its baseline. Polls that time out
/// count their full bound toward `max_wait`; polls that return early count the
/// time they actually took. Returns the state reached, which is `target`.
pub fn wait_for_state<S: NativeStream>(
    stream: &S,
    target: StreamState,
    wait: &WaitConfig,
) -> Result<StreamState> {
    let mut current = stream.state();
    let mut waited = Duration::ZERO;

    while current != target {
        if current == StreamState::Disconnected {
            return Err(StreamError::Disconnected);
        }
        if waited >= wait.max_wait {
            return Err(StreamError::Timeout {
                target,
                last: current,
                waited,
            });
        }

        let started = Instant::now();
        match stream.wait_for_state_change(current, wait.poll_timeout) {
            Ok(next) => {
                waited += started.elapsed();
                current = next;
            }
            Err(NativeError::Timeout) => {
                waited += wait.poll_timeout;
                current = stream.state();
            }
            Err(source) => return Err(StreamError::Wait { target, source }),
        }
    }

    Ok(current)
}

/// Issues transitions against the owner's stream and mirrors the resulting
/// state into the [`Clock`].
pub struct TransitionDriver {
    wait: WaitConfig,
    clock: Arc<Clock>,
}

impl TransitionDriver {
    pub fn new(wait: WaitConfig, clock: Arc<Clock>) -> Self {
        Self { wait, clock }
    }

    /// Requests `transition` on `stream`, then waits for it if `mode` is blocking.
    pub fn drive<S: NativeStream>(
        &self,
        stream: &S,
        transition: Transition,
        mode: TransitionMode,
    ) -> Result<()> {
        debug!("Requesting {} ({:?})", transition, mode);
        if let Err(e) = transition.request(stream) {
            error!("Failed to {} the stream: {}", transition, e);
            self.clock.set_state(stream.state());
            return Err(StreamError::transition(transition, e));
        }
        self.clock.set_state(stream.state());

        if mode == TransitionMode::NonBlocking {
            return Ok(());
        }

        match wait_for_state(stream, transition.target(), &self.wait) {
            Ok(state) => {
                self.clock.set_state(state);
                Ok(())
            }
            Err(e) => {
                error!("Stream did not {}: {}", transition, e);
                self.clock.set_state(stream.state());
                Err(e)
            }
        }
    }

    /// Drives the owner's open stream. Fails with [`StreamError::NotOpen`] if
    /// there is none.
    pub fn request<P: AudioPlatform>(
        &self,
        owner: &StreamOwner<P>,
        transition: Transition,
        mode: TransitionMode,
    ) -> Result<()> {
        let stream = owner.stream().ok_or(StreamError::NotOpen)?;
        self.drive(stream, transition, mode)
    }

    /// Stop, flush and destroy, all blocking. Every step runs; the first
    /// failure is returned once the handle is gone.
    pub fn teardown<P: AudioPlatform>(&self, owner: &mut StreamOwner<P>) -> Result<()> {
        if !owner.is_open() {
            debug!("Teardown requested with no open stream");
            return Ok(());
        }

        let stopped = self.request(owner, Transition::Stop, TransitionMode::Blocking);
        let flushed = self.request(owner, Transition::Flush, TransitionMode::Blocking);
        let destroyed = owner.destroy_stream();
        info!("Stream torn down");

        stopped.and(flushed).and(destroyed)
    }

    /// Stop, flush, destroy, create, start, with every step in `mode`.
    ///
    /// Failures before the create are logged and ignored; the old stream is
    /// usually already dead. Create and start failures are returned.
    pub fn restart<P: AudioPlatform>(
        &self,
        owner: &mut StreamOwner<P>,
        mode: TransitionMode,
    ) -> Result<()> {
        if owner.is_open() {
            if let Err(e) = self.request(owner, Transition::Stop, mode) {
                warn!("Ignoring stop failure during restart: {}", e);
            }
            if let Err(e) = self.request(owner, Transition::Flush, mode) {
                warn!("Ignoring flush failure during restart: {}", e);
            }
            if let Err(e) = owner.destroy_stream() {
                warn!("Ignoring destroy failure during restart: {}", e);
            }
        }

        owner.create_stream()?;
        self.request(owner, Transition::Start, mode)?;
        info!("Stream restarted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::output::stream_owner::tests::owner_on;
    use crate::engine::platform::mock::{Confirmation, MockEvent, MockOp, MockPlatform};

    fn driver() -> TransitionDriver {
        TransitionDriver::new(WaitConfig::default(), Arc::new(Clock::new()))
    }

    #[test]
    fn test_transition_targets() {
        assert_eq!(Transition::Start.target(), StreamState::Started);
        assert_eq!(Transition::Pause.target(), StreamState::Paused);
        assert_eq!(Transition::Stop.target(), StreamState::Stopped);
        assert_eq!(Transition::Flush.target(), StreamState::Flushed);
        assert_eq!(Transition::Flush.to_string(), "flush");
    }

    #[test]
    fn test_blocking_start_already_confirmed_does_not_poll() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();

        driver()
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap();
        assert_eq!(mock.current_state(), Some(StreamState::Started));
        assert_eq!(mock.wait_calls(), 0);
    }

    #[test]
    fn test_blocking_start_confirmed_on_first_poll() {
        let mock = MockPlatform::new();
        mock.set_confirmation(Confirmation::OnPoll);
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();

        driver()
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap();
        assert_eq!(mock.current_state(), Some(StreamState::Started));
        assert_eq!(mock.wait_calls(), 1);
    }

    #[test]
    fn test_blocking_wait_times_out_after_bound() {
        let mock = MockPlatform::new();
        mock.set_confirmation(Confirmation::Never);
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();

        let err = driver()
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap_err();
        match err {
            StreamError::Timeout {
                target,
                last,
                waited,
            } => {
                assert_eq!(target, StreamState::Started);
                assert_eq!(last, StreamState::Starting);
                assert_eq!(waited, Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // 10s bound / 2s per poll
        assert_eq!(mock.wait_calls(), 5);
    }

    /// Stays in `Starting` and fails every wait with `error`.
    struct BrokenWait {
        error: NativeError,
    }

    impl NativeStream for BrokenWait {
        fn request_start(&self) -> NativeResult<()> {
            Ok(())
        }
        fn request_pause(&self) -> NativeResult<()> {
            Ok(())
        }
        fn request_stop(&self) -> NativeResult<()> {
            Ok(())
        }
        fn request_flush(&self) -> NativeResult<()> {
            Ok(())
        }
        fn state(&self) -> StreamState {
            StreamState::Starting
        }
        fn wait_for_state_change(&self, _: StreamState, _: Duration) -> NativeResult<StreamState> {
            Err(self.error.clone())
        }
        fn xrun_count(&self) -> u32 {
            0
        }
        fn frames_per_burst(&self) -> u32 {
            0
        }
        fn buffer_size_in_frames(&self) -> u32 {
            0
        }
        fn set_buffer_size_in_frames(&self, frames: u32) -> NativeResult<u32> {
            Ok(frames)
        }
        fn sample_rate(&self) -> u32 {
            0
        }
        fn channel_count(&self) -> u16 {
            0
        }
        fn device_id(&self) -> String {
            String::new()
        }
        fn close(&mut self) -> NativeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_wait_failure_is_distinct_from_timeout() {
        let stream = BrokenWait {
            error: NativeError::Internal("poll failed".to_string()),
        };
        let err = wait_for_state(&stream, StreamState::Started, &WaitConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Wait {
                target: StreamState::Started,
                source: NativeError::Internal(_),
            }
        ));
    }

    #[test]
    fn test_wait_returns_at_once_when_already_in_target() {
        let stream = BrokenWait {
            error: NativeError::Timeout,
        };
        let state = wait_for_state(&stream, StreamState::Starting, &WaitConfig::default()).unwrap();
        assert_eq!(state, StreamState::Starting);
    }

    #[test]
    fn test_non_blocking_does_not_wait() {
        let mock = MockPlatform::new();
        mock.set_confirmation(Confirmation::Never);
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();

        driver()
            .request(&owner, Transition::Start, TransitionMode::NonBlocking)
            .unwrap();
        assert_eq!(mock.current_state(), Some(StreamState::Starting));
        assert_eq!(mock.wait_calls(), 0);
    }

    #[test]
    fn test_rejected_request_is_transition_error() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();
        mock.fail_next(MockOp::Pause, NativeError::Internal("busy".to_string()));

        let err = driver()
            .request(&owner, Transition::Pause, TransitionMode::Blocking)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Transition {
                transition: Transition::Pause,
                ..
            }
        ));
        assert_eq!(mock.wait_calls(), 0);
    }

    #[test]
    fn test_transitions_are_not_guarded_by_model_state() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();

        // Pausing a stream that was never started still reaches the hardware.
        driver()
            .request(&owner, Transition::Pause, TransitionMode::NonBlocking)
            .unwrap();
        assert!(mock
            .events()
            .contains(&MockEvent::Requested(1, MockOp::Pause)));
    }

    #[test]
    fn test_request_without_stream_is_not_open() {
        let mock = MockPlatform::new();
        let owner = owner_on(&mock);
        let err = driver()
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap_err();
        assert!(matches!(err, StreamError::NotOpen));
    }

    #[test]
    fn test_teardown_closes_stream() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();
        let driver = driver();
        driver
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap();

        driver.teardown(&mut owner).unwrap();
        assert!(!owner.is_open());
        assert_eq!(mock.open_stream_count(), 0);
        assert_eq!(owner.clock().get_state(), StreamState::Closed);
    }

    #[test]
    fn test_teardown_releases_handle_after_step_failure() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();
        mock.fail_next(MockOp::Stop, NativeError::Internal("stuck".to_string()));

        let err = driver().teardown(&mut owner).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Transition {
                transition: Transition::Stop,
                ..
            }
        ));
        assert!(!owner.is_open());
        assert_eq!(mock.open_stream_count(), 0);
    }

    #[test]
    fn test_teardown_without_stream_is_noop() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        driver().teardown(&mut owner).unwrap();
        assert!(mock.events().is_empty());
    }

    #[test]
    fn test_restart_after_disconnect_ignores_stop_failure() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();
        let driver = driver();
        driver
            .request(&owner, Transition::Start, TransitionMode::Blocking)
            .unwrap();
        mock.disconnect();

        driver
            .restart(&mut owner, TransitionMode::NonBlocking)
            .unwrap();
        assert_eq!(mock.current_stream_id(), Some(2));
        assert_eq!(mock.current_state(), Some(StreamState::Started));
        assert_eq!(mock.open_stream_count(), 1);
    }

    #[test]
    fn test_restart_returns_create_failure() {
        let mock = MockPlatform::new();
        let mut owner = owner_on(&mock);
        owner.create_stream().unwrap();
        mock.fail_next(MockOp::Open, NativeError::NoDevice);

        let err = driver()
            .restart(&mut owner, TransitionMode::Blocking)
            .unwrap_err();
        assert!(matches!(err, StreamError::Open(NativeError::NoDevice)));
        assert!(!owner.is_open());
    }
}
