use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::buffer::{create_audio_buffer, AudioBufferConsumer, AudioBufferProducer};
use crate::engine::output::RenderEngine;

/// Frames generated per push.
const CHUNK_FRAMES: usize = 256;
const AMPLITUDE: f32 = 0.2 * i16::MAX as f32;

enum GeneratorCommand {
    SetFrequency(f32),
    Stop,
}

/// Output format the generator follows; updated whenever a stream opens.
#[derive(Default)]
struct OutputFormat {
    sample_rate: AtomicU32,
    channels: AtomicU16,
}

struct Generator {
    handle: JoinHandle<AudioBufferProducer>,
    command_tx: Sender<GeneratorCommand>,
}

/// Demo host engine: a generator thread writes a sine tone into a ring buffer
/// that the audio callback drains.
pub struct AudioEngine {
    consumer: Mutex<AudioBufferConsumer>,
    producer: Mutex<Option<AudioBufferProducer>>,
    format: Arc<OutputFormat>,
    is_generating: Arc<AtomicBool>,
    generator: Mutex<Option<Generator>>,
    /// Samples rendered as silence because the buffer ran dry.
    starved_samples: AtomicU64,
}

impl AudioEngine {
    /// Creates an engine whose ring buffer holds `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = create_audio_buffer(capacity);
        Self {
            consumer: Mutex::new(consumer),
            producer: Mutex::new(Some(producer)),
            format: Arc::new(OutputFormat::default()),
            is_generating: Arc::new(AtomicBool::new(false)),
            generator: Mutex::new(None),
            starved_samples: AtomicU64::new(0),
        }
    }

    /// Starts generating a tone, or retunes the running one.
    pub fn play_tone(&self, frequency: f32) -> std::io::Result<()> {
        let mut generator = self.generator.lock();
        if let Some(running) = generator.as_ref() {
            let _ = running
                .command_tx
                .send(GeneratorCommand::SetFrequency(frequency));
            return Ok(());
        }

        let Some(mut producer) = self.producer.lock().take() else {
            return Err(std::io::Error::other("producer missing"));
        };
        let (tx, rx) = mpsc::channel();
        let is_generating = Arc::clone(&self.is_generating);
        let format = Arc::clone(&self.format);
        is_generating.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("tone-generator".to_string())
            .spawn(move || {
                let mut frequency = frequency;
                let mut phase = 0.0f32;
                let mut chunk: Vec<i16> = Vec::new();

                while is_generating.load(Ordering::Relaxed) {
                    while let Ok(cmd) = rx.try_recv() {
                        match cmd {
                            GeneratorCommand::SetFrequency(hz) => frequency = hz,
                            GeneratorCommand::Stop => {
                                is_generating.store(false, Ordering::SeqCst);
                                break;
                            }
                        }
                    }

                    if !is_generating.load(Ordering::Relaxed) {
                        break;
                    }

                    let sample_rate = format.sample_rate.load(Ordering::Relaxed);
                    let channels = format.channels.load(Ordering::Relaxed) as usize;
                    if sample_rate == 0 || channels == 0 {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }

                    // If buffer is full, sleep briefly to avoid pegging CPU
                    if producer.vacant_len() < CHUNK_FRAMES * channels {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }

                    chunk.clear();
                    let step = TAU * frequency / sample_rate as f32;
                    for _ in 0..CHUNK_FRAMES {
                        let value = (phase.sin() * AMPLITUDE) as i16;
                        chunk.extend(std::iter::repeat(value).take(channels));
                        phase = (phase + step) % TAU;
                    }
                    producer.push_slice(&chunk);
                }

                producer
            });

        match spawned {
            Ok(handle) => {
                info!("Tone generator started at {} Hz", frequency);
                *generator = Some(Generator {
                    handle,
                    command_tx: tx,
                });
                Ok(())
            }
            Err(e) => {
                self.is_generating.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stops the generator thread and keeps its producer for the next tone.
    pub fn stop_tone(&self) {
        let Some(generator) = self.generator.lock().take() else {
            return;
        };
        let _ = generator.command_tx.send(GeneratorCommand::Stop);
        self.is_generating.store(false, Ordering::SeqCst);
        match generator.handle.join() {
            Ok(producer) => *self.producer.lock() = Some(producer),
            Err(_) => debug!("Tone generator panicked"),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.generator.lock().is_some()
    }

    pub fn starved_samples(&self) -> u64 {
        self.starved_samples.load(Ordering::Relaxed)
    }
}

impl RenderEngine for AudioEngine {
    fn render_audio(&self, buffer: &mut [i16], _frames: usize) {
        let filled = match self.consumer.try_lock() {
            Some(mut consumer) => consumer.pop_slice(buffer),
            None => 0,
        };
        if filled < buffer.len() {
            buffer[filled..].fill(0);
            self.starved_samples
                .fetch_add((buffer.len() - filled) as u64, Ordering::Relaxed);
        }
    }

    fn configure(&self, sample_rate: u32, channels: u16) {
        let old_rate = self.format.sample_rate.swap(sample_rate, Ordering::SeqCst);
        let old_channels = self.format.channels.swap(channels, Ordering::SeqCst);
        if old_rate != sample_rate || old_channels != channels {
            // Queued samples were generated for the old layout.
            let dropped = self.consumer.lock().clear();
            debug!(
                "Output format now {}Hz/{}ch, dropped {} queued samples",
                sample_rate, channels, dropped
            );
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop_tone();
    }
}
