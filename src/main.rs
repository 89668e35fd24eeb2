use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mewo_stream_backend::{AudioBackend, AudioEngine, BackendConfig, BackendSlot, CpalPlatform};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PLAY_SECONDS: u64 = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    info!("--- Output Stream Backend Example ---");

    // Room for a quarter second of 48kHz stereo.
    let engine = Arc::new(AudioEngine::new(48000 / 2));
    let slot = BackendSlot::new();
    slot.instantiate("demo");
    let backend = slot.get_or_create(CpalPlatform::new(), engine.clone(), BackendConfig::default());

    info!(
        "Backend {} on {}: {}Hz, {} channels, {} frames",
        backend.name(),
        backend.device_name(),
        backend.sample_rate(),
        backend.output_channels(),
        backend.buffer_size()
    );

    engine.play_tone(440.0)?;
    backend.start(false)?;
    info!("Playback started for {} seconds", PLAY_SECONDS);

    for second in 1..=PLAY_SECONDS {
        thread::sleep(Duration::from_secs(1));
        if second == 3 {
            engine.play_tone(660.0)?;
        }
        let stats = backend.stats();
        let clock = backend.clock();
        info!(
            "{:?}: {:.2}s rendered ({}ch), {} underruns, buffer {} frames, {} recoveries",
            stats.state,
            clock.processed_secs(),
            clock.get_channels(),
            stats.underruns.underrun_count,
            stats.underruns.buffer_size_frames,
            stats.recoveries
        );
    }

    backend.stop()?;
    engine.stop_tone();
    drop(backend);
    slot.deinstantiate();

    info!(
        "Example finished ({} samples of silence)",
        engine.starved_samples()
    );
    Ok(())
}
