use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mewo_stream_backend::engine::platform::mock::{
    Confirmation, MockDevice, MockEvent, MockOp, MockPlatform,
};
use mewo_stream_backend::{
    AudioBackend, BackendConfig, BackendSlot, NativeError, OutputManager, RecoveryConfig,
    RenderEngine, StreamError, StreamState,
};
use parking_lot::Mutex;

struct Constant(i16);

impl RenderEngine for Constant {
    fn render_audio(&self, buffer: &mut [i16], _frames: usize) {
        buffer.fill(self.0);
    }
}

/// Blocks inside the render call until released, while the gate is closed.
struct GatedEngine {
    closed: AtomicBool,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl RenderEngine for GatedEngine {
    fn render_audio(&self, buffer: &mut [i16], _frames: usize) {
        if self.closed.load(Ordering::SeqCst) {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
        }
        buffer.fill(7);
    }
}

fn device() -> MockDevice {
    MockDevice {
        frames_per_burst: 96,
        buffer_size_frames: 192,
        buffer_capacity_frames: 4096,
        ..Default::default()
    }
}

fn fast_recovery(max_attempts: u32) -> BackendConfig {
    BackendConfig {
        recovery: RecoveryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        ..Default::default()
    }
}

fn backend_on(mock: &MockPlatform, config: BackendConfig) -> OutputManager<MockPlatform> {
    OutputManager::new(mock.clone(), Arc::new(Constant(3)), config)
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn opened(mock: &MockPlatform) -> usize {
    mock.events()
        .iter()
        .filter(|e| matches!(e, MockEvent::Opened(_)))
        .count()
}

fn position(events: &[MockEvent], event: &MockEvent) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("{event:?} not in {events:?}"))
}

#[test]
fn test_underrun_scenario() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, BackendConfig::default());

    backend.start(false).unwrap();
    assert_eq!(backend.stream_state(), StreamState::Started);

    for _ in 0..3 {
        let buffer = mock.deliver_buffer(96).unwrap();
        assert!(buffer.iter().all(|&s| s == 3));
    }
    assert_eq!(backend.stats().underruns.buffer_size_frames, 192);
    assert_eq!(mock.current_buffer_size(), Some(192));

    mock.set_xrun_count(5);
    mock.deliver_buffer(96).unwrap();
    let underruns = backend.stats().underruns;
    assert_eq!(underruns.buffer_size_frames, 192 + 96);
    assert_eq!(underruns.underrun_count, 5);
    assert_eq!(mock.current_buffer_size(), Some(192 + 96));

    backend.stop().unwrap();
    assert_eq!(backend.stream_state(), StreamState::Closed);
    assert!(!backend.is_stream_open());
    assert_eq!(mock.open_stream_count(), 0);
}

#[test]
fn test_underrun_growth_per_event() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, BackendConfig::default());
    backend.start(false).unwrap();

    let counts = [1, 4, 6, 10, 11];
    for count in counts {
        mock.set_xrun_count(count);
        mock.deliver_buffer(96).unwrap();
    }

    let underruns = backend.stats().underruns;
    assert_eq!(underruns.buffer_size_frames, 192 + 5 * 96);
    assert_eq!(underruns.underrun_count, 11);
    assert_eq!(underruns.previous_underrun_count, 10);
}

#[test]
fn test_start_stop_start_leaves_no_stream_behind() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, BackendConfig::default());

    backend.start(false).unwrap();
    backend.stop().unwrap();
    assert!(!backend.is_stream_open());
    assert_eq!(mock.open_stream_count(), 0);

    backend.start(true).unwrap();
    assert_eq!(mock.open_stream_count(), 1);
    assert_eq!(mock.current_state(), Some(StreamState::Started));

    let events = mock.events();
    assert!(position(&events, &MockEvent::Closed(1)) < position(&events, &MockEvent::Opened(2)));
}

#[test]
fn test_stop_without_stream_is_ok() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, BackendConfig::default());
    backend.stop().unwrap();
    backend.stop().unwrap();
    backend.destroy_stream().unwrap();
}

#[test]
fn test_processed_frames_count_every_callback() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, BackendConfig::default());
    backend.start(false).unwrap();

    for _ in 0..10 {
        let buffer = mock.deliver_buffer(128).unwrap();
        assert_eq!(buffer.len(), 128 * 2);
    }
    assert_eq!(backend.stats().processed_frames, 1280);
}

#[test]
fn test_start_times_out_when_never_confirmed() {
    let mock = MockPlatform::with_device(device());
    mock.set_confirmation(Confirmation::Never);
    let backend = backend_on(&mock, BackendConfig::default());

    let err = backend.start(false).unwrap_err();
    assert!(matches!(
        err,
        StreamError::Timeout {
            target: StreamState::Started,
            ..
        }
    ));
    assert!(!backend.is_playback_requested());
    assert_eq!(mock.wait_calls(), 5);
}

#[test]
fn test_disconnect_restarts_once() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, fast_recovery(5));
    backend.start(false).unwrap();

    assert!(mock.disconnect());
    wait_until("recovery", || backend.stats().recoveries == 1);

    assert_eq!(backend.stream_state(), StreamState::Started);
    assert_eq!(mock.current_stream_id(), Some(2));
    assert_eq!(mock.current_state(), Some(StreamState::Started));
    assert_eq!(mock.open_stream_count(), 1);
    assert_eq!(opened(&mock), 2);

    // the new stream renders
    assert!(mock.deliver_buffer(32).is_some());
}

#[test]
fn test_recovery_waits_for_in_flight_render() {
    let mock = MockPlatform::with_device(device());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let engine = Arc::new(GatedEngine {
        closed: AtomicBool::new(false),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let backend = OutputManager::new(mock.clone(), engine.clone(), fast_recovery(5));
    backend.start(false).unwrap();

    engine.closed.store(true, Ordering::SeqCst);
    let hardware = mock.clone();
    let render = thread::spawn(move || hardware.deliver_buffer(64));
    entered_rx.recv().unwrap();

    assert!(mock.disconnect());
    thread::sleep(Duration::from_millis(50));
    // diagnostics answer while the restart waits on the render
    assert_eq!(backend.stats().recoveries, 0);
    assert!(backend.is_playback_requested());
    assert!(!mock.events().contains(&MockEvent::Closed(1)));

    engine.closed.store(false, Ordering::SeqCst);
    release_tx.send(()).unwrap();
    let rendered = render.join().unwrap().unwrap();
    assert!(rendered.iter().all(|&s| s == 7));

    wait_until("recovery", || backend.stats().recoveries == 1);
    let events = mock.events();
    assert!(position(&events, &MockEvent::RenderEnd(1)) < position(&events, &MockEvent::Closed(1)));
    assert!(position(&events, &MockEvent::Closed(1)) < position(&events, &MockEvent::Opened(2)));
}

#[test]
fn test_recovery_gives_up_after_max_attempts() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, fast_recovery(3));
    backend.start(false).unwrap();
    for _ in 0..3 {
        mock.fail_next(MockOp::Open, NativeError::NoDevice);
    }

    assert!(mock.disconnect());
    wait_until("recovery to give up", || backend.stats().exhausted_recoveries == 1);

    let stats = backend.stats();
    assert_eq!(stats.recoveries, 0);
    assert!(!stats.open);
    assert_eq!(opened(&mock), 1);
    assert_eq!(mock.open_stream_count(), 0);
}

#[test]
fn test_stop_cancels_pending_recovery() {
    let mock = MockPlatform::with_device(device());
    let config = BackendConfig {
        recovery: RecoveryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        },
        ..Default::default()
    };
    let backend = backend_on(&mock, config);
    backend.start(false).unwrap();
    mock.fail_next(MockOp::Open, NativeError::NoDevice);

    assert!(mock.disconnect());
    // the first attempt fails to open and deletes its builder
    wait_until("first attempt", || {
        mock.events().contains(&MockEvent::BuilderDeleted(2))
    });

    let started = Instant::now();
    backend.stop().unwrap();
    drop(backend);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(opened(&mock), 1);
    assert_eq!(mock.open_stream_count(), 0);
}

#[test]
fn test_start_recovers_from_disconnect_while_idle() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, fast_recovery(5));
    assert!(backend.is_stream_open());

    assert!(mock.disconnect());
    assert_eq!(backend.stream_state(), StreamState::Disconnected);

    backend.start(false).unwrap();
    assert_eq!(backend.stream_state(), StreamState::Started);
    assert_eq!(mock.current_stream_id(), Some(2));
    assert_eq!(mock.open_stream_count(), 1);
    assert!(mock.deliver_buffer(32).is_some());

    let events = mock.events();
    assert!(position(&events, &MockEvent::Closed(1)) < position(&events, &MockEvent::Opened(2)));
}

#[test]
fn test_disconnect_after_stop_is_ignored() {
    let mock = MockPlatform::with_device(device());
    let backend = backend_on(&mock, fast_recovery(5));
    backend.start(false).unwrap();
    backend.stop().unwrap();
    backend.create_stream().unwrap();

    assert!(mock.disconnect());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(backend.stats().recoveries, 0);
    assert_eq!(opened(&mock), 2);
}

#[test]
fn test_slot_hands_out_one_instance() {
    let mock = MockPlatform::with_device(device());
    let slot = BackendSlot::new();
    slot.instantiate("studio");

    let first: Arc<dyn AudioBackend> =
        slot.get_or_create(mock.clone(), Arc::new(Constant(0)), BackendConfig::default());
    let second = slot.get_or_create(mock.clone(), Arc::new(Constant(0)), BackendConfig::default());
    first.start(false).unwrap();
    assert_eq!(second.stream_state(), StreamState::Started);
    assert_eq!(opened(&mock), 1);

    drop(first);
    drop(second);
    slot.deinstantiate();
    assert_eq!(mock.open_stream_count(), 0);
}
