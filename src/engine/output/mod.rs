pub mod backend_slot;
pub mod output_manager;
pub mod recovery;
pub mod stream_owner;
pub mod transition;
pub mod underrun;

use crate::engine::error::Result;

/// The host engine's render entry point, called from the audio thread.
pub trait RenderEngine: Send + Sync {
    /// Fills `buffer` with exactly `frames` interleaved frames
    /// (`buffer.len() == frames * channels`). Must not block or allocate.
    fn render_audio(&self, buffer: &mut [i16], frames: usize);

    /// Called on the control thread whenever a stream is (re)opened.
    fn configure(&self, _sample_rate: u32, _channels: u16) {}
}

/// What the host engine sees of an output backend.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_realtime(&self) -> bool;

    /// Opens the stream if needed and starts it, waiting for confirmation.
    fn start(&self, for_latency_measurement: bool) -> Result<()>;

    /// Stops, flushes and closes the stream.
    fn stop(&self) -> Result<()>;

    fn device_name(&self) -> String;

    fn sample_rate(&self) -> u32;

    /// Current buffer depth in frames.
    fn buffer_size(&self) -> u32;

    fn input_channels(&self) -> u16;

    fn output_channels(&self) -> u16;

    fn can_change_sample_rate_when_running(&self) -> bool;

    fn can_change_buffer_size_when_running(&self) -> bool;

    fn interleaved(&self) -> bool {
        true
    }
}
