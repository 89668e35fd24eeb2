use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::engine::clock::{Clock, StreamState};
use crate::engine::config::BackendConfig;
use crate::engine::error::Result;
use crate::engine::output::recovery::{Attempt, RecoveryCoordinator};
use crate::engine::output::stream_owner::{ErrorHandler, StreamOwner};
use crate::engine::output::transition::{Transition, TransitionDriver, TransitionMode};
use crate::engine::output::underrun::{RenderPath, UnderrunSnapshot};
use crate::engine::output::{AudioBackend, RenderEngine};
use crate::engine::platform::{AudioPlatform, NativeError, NativeStream};

/// Last values read from the live stream. Served as-is when no stream is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CapabilityCache {
    device_id: String,
    sample_rate: u32,
    buffer_size: u32,
    channels: u16,
}

/// Point-in-time view of the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub state: StreamState,
    pub open: bool,
    pub processed_frames: u64,
    pub underruns: UnderrunSnapshot,
    pub recoveries: u32,
    pub exhausted_recoveries: u32,
}

struct Shared<P: AudioPlatform> {
    this: Weak<Shared<P>>,
    name: String,
    owner: Mutex<StreamOwner<P>>,
    driver: TransitionDriver,
    render: Arc<RenderPath>,
    recovery: RecoveryCoordinator,
    playback_requested: AtomicBool,
    cache: Mutex<CapabilityCache>,
}

/// One backend instance: a single output stream plus everything that keeps it
/// running.
pub struct OutputManager<P: AudioPlatform> {
    shared: Arc<Shared<P>>,
}

impl<P: AudioPlatform> OutputManager<P> {
    /// Builds the backend and opens its stream right away. An open failure is
    /// logged; [`AudioBackend::start`] will try again.
    pub fn new(platform: P, engine: Arc<dyn RenderEngine>, config: BackendConfig) -> Self {
        let clock = Arc::new(Clock::new());
        let render = Arc::new(RenderPath::new(engine, Arc::clone(&clock)));

        let shared = Arc::new_cyclic(|this: &Weak<Shared<P>>| {
            let weak = this.clone();
            let on_error: ErrorHandler = Arc::new(move |error: NativeError| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_stream_error(error);
                }
            });

            let name = format!("{} ({})", platform.name(), config.instance_name);
            Shared {
                this: this.clone(),
                name,
                owner: Mutex::new(StreamOwner::new(
                    platform,
                    config.stream.clone(),
                    Arc::clone(&render),
                    on_error,
                )),
                driver: TransitionDriver::new(config.wait, clock),
                render,
                recovery: RecoveryCoordinator::new(config.recovery),
                playback_requested: AtomicBool::new(false),
                cache: Mutex::new(CapabilityCache::default()),
            }
        });

        let manager = Self { shared };
        if let Err(e) = manager.create_stream() {
            warn!("Initial stream open failed: {}", e);
        }
        manager
    }

    pub fn create_stream(&self) -> Result<()> {
        self.shared.owner.lock().create_stream()?;
        self.shared.refresh_capabilities();
        Ok(())
    }

    pub fn destroy_stream(&self) -> Result<()> {
        self.shared.owner.lock().destroy_stream()
    }

    /// Requests `transition` on the open stream.
    pub fn transition(&self, transition: Transition, mode: TransitionMode) -> Result<()> {
        let owner = self.shared.owner.lock();
        self.shared.driver.request(&owner, transition, mode)
    }

    pub fn pause(&self, mode: TransitionMode) -> Result<()> {
        self.transition(Transition::Pause, mode)
    }

    pub fn flush(&self, mode: TransitionMode) -> Result<()> {
        self.transition(Transition::Flush, mode)
    }

    /// Stop, flush, destroy, create and start, all in `mode`.
    pub fn restart_stream(&self, mode: TransitionMode) -> Result<()> {
        let result = {
            let mut owner = self.shared.owner.lock();
            self.shared.driver.restart(&mut owner, mode)
        };
        self.shared.refresh_capabilities();
        result
    }

    /// Feeds an error as if the stream's error callback had reported it.
    pub fn handle_stream_error(&self, error: NativeError) {
        self.shared.handle_stream_error(error);
    }

    /// Whether a stream handle is held. Does not take the owner lock, so it
    /// answers while a restart is in progress.
    pub fn is_stream_open(&self) -> bool {
        self.shared.render.clock().is_stream_open()
    }

    /// Last stream state observed.
    pub fn stream_state(&self) -> StreamState {
        self.shared.render.clock().get_state()
    }

    pub fn is_playback_requested(&self) -> bool {
        self.shared.playback_requested.load(Ordering::SeqCst)
    }

    pub fn clock(&self) -> &Arc<Clock> {
        self.shared.render.clock()
    }

    /// Snapshot of the backend's counters. Also logs buffer adaptations the
    /// audio thread made since the last call.
    pub fn stats(&self) -> StreamStats {
        self.shared.report_underruns();
        StreamStats {
            state: self.stream_state(),
            open: self.is_stream_open(),
            processed_frames: self.shared.render.clock().processed_frames(),
            underruns: self.shared.render.underruns().snapshot(),
            recoveries: self.shared.recovery.recoveries(),
            exhausted_recoveries: self.shared.recovery.exhausted(),
        }
    }
}

impl<P: AudioPlatform> Shared<P> {
    fn start(&self, for_latency_measurement: bool) -> Result<()> {
        info!(
            "Starting {} (latency measurement: {})",
            self.name, for_latency_measurement
        );
        self.playback_requested.store(true, Ordering::SeqCst);

        let result = {
            let mut owner = self.owner.lock();
            let dead = owner
                .stream()
                .is_some_and(|s| matches!(s.state(), StreamState::Disconnected | StreamState::Closed));
            if dead {
                info!("Replacing dead stream before start");
                if let Err(e) = owner.destroy_stream() {
                    warn!("Failed to release dead stream: {}", e);
                }
            }

            let created = if owner.is_open() {
                Ok(())
            } else {
                owner.create_stream()
            };
            let started = created.and_then(|()| {
                self.driver
                    .request(&owner, Transition::Start, TransitionMode::Blocking)
            });
            if started.as_ref().is_err_and(|e| e.is_disconnect()) {
                // the next start opens a fresh stream
                let _ = owner.destroy_stream();
            }
            started
        };

        match result {
            Ok(()) => {
                self.refresh_capabilities();
                Ok(())
            }
            Err(e) => {
                error!("Failed to start {}: {}", self.name, e);
                self.playback_requested.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        info!("Stopping {}", self.name);
        self.playback_requested.store(false, Ordering::SeqCst);
        self.recovery.cancel();
        self.report_underruns();
        let mut owner = self.owner.lock();
        self.driver.teardown(&mut owner)
    }

    fn handle_stream_error(&self, error: NativeError) {
        match error {
            NativeError::Disconnected => {
                self.render.clock().set_state(StreamState::Disconnected);
                if !self.playback_requested.load(Ordering::SeqCst) {
                    info!("Device disconnected while stopped, the next start reopens the stream");
                    return;
                }
                warn!("Device disconnected, scheduling stream restart");
                let weak = self.this.clone();
                self.recovery.schedule(move || match weak.upgrade() {
                    Some(shared) => shared.recover_once(),
                    None => Attempt::Skipped,
                });
            }
            other => warn!("Ignoring stream error: {}", other),
        }
    }

    /// One restart attempt, run on the recovery worker.
    fn recover_once(&self) -> Attempt {
        let result = {
            let mut owner = self.owner.lock();
            if !self.playback_requested.load(Ordering::SeqCst) {
                return Attempt::Skipped;
            }
            let running = owner
                .stream()
                .is_some_and(|s| matches!(s.state(), StreamState::Starting | StreamState::Started));
            if running {
                debug!("Stream already running, nothing to recover");
                return Attempt::Skipped;
            }
            self.driver.restart(&mut owner, TransitionMode::NonBlocking)
        };

        match result {
            Ok(()) => {
                self.refresh_capabilities();
                Attempt::Recovered
            }
            Err(e) => Attempt::Failed(e),
        }
    }

    fn report_underruns(&self) {
        let Some(report) = self.render.underruns().take_report() else {
            return;
        };
        if report.grown > 0 {
            warn!(
                "{} underrun(s) on {}, buffer grown to {} frames",
                report.grown, self.name, report.buffer_size_frames
            );
        }
        if report.rejected > 0 {
            warn!(
                "{} buffer growth request(s) rejected on {}, last asked for {} frames",
                report.rejected, self.name, report.last_rejected_frames
            );
        }
    }

    /// Reads the live values into the cache and returns the cache.
    fn refresh_capabilities(&self) -> CapabilityCache {
        let owner = self.owner.lock();
        let mut cache = self.cache.lock();
        if let Some(stream) = owner.stream() {
            cache.device_id = stream.device_id();
            cache.sample_rate = stream.sample_rate();
            cache.buffer_size = stream.buffer_size_in_frames();
            cache.channels = stream.channel_count();
        }
        cache.clone()
    }
}

impl<P: AudioPlatform> AudioBackend for OutputManager<P> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn is_realtime(&self) -> bool {
        true
    }

    fn start(&self, for_latency_measurement: bool) -> Result<()> {
        self.shared.start(for_latency_measurement)
    }

    fn stop(&self) -> Result<()> {
        self.shared.stop()
    }

    fn device_name(&self) -> String {
        self.shared.refresh_capabilities().device_id
    }

    fn sample_rate(&self) -> u32 {
        self.shared.refresh_capabilities().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.shared.refresh_capabilities().buffer_size
    }

    fn input_channels(&self) -> u16 {
        self.shared.refresh_capabilities().channels
    }

    fn output_channels(&self) -> u16 {
        self.shared.refresh_capabilities().channels
    }

    fn can_change_sample_rate_when_running(&self) -> bool {
        false
    }

    fn can_change_buffer_size_when_running(&self) -> bool {
        true
    }
}

impl<P: AudioPlatform> Drop for OutputManager<P> {
    fn drop(&mut self) {
        self.shared.playback_requested.store(false, Ordering::SeqCst);
        self.shared.recovery.shutdown();
        let mut owner = self.shared.owner.lock();
        if let Err(e) = self.shared.driver.teardown(&mut owner) {
            error!("Teardown of {} failed: {}", self.shared.name, e);
        }
    }
}
