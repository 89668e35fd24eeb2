//! Stream Handle Owner: creates and destroys the one native stream a backend
//! instance may have open.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::engine::clock::{Clock, StreamState};
use crate::engine::config::StreamConfig;
use crate::engine::error::{Result, StreamError};
use crate::engine::output::underrun::RenderPath;
use crate::engine::platform::{
    AudioPlatform, CallbackStream, NativeError, NativeStream, StreamCallbacks,
};

/// Receives errors reported by the stream's error callback.
pub type ErrorHandler = Arc<dyn Fn(NativeError) + Send + Sync>;

/// An open stream together with the builder it was opened from.
pub struct StreamHandle<P: AudioPlatform> {
    stream: P::Stream,
    builder: P::Builder,
}

pub struct StreamOwner<P: AudioPlatform> {
    platform: P,
    config: StreamConfig,
    render: Arc<RenderPath>,
    on_error: ErrorHandler,
    handle: Option<StreamHandle<P>>,
}

impl<P: AudioPlatform> StreamOwner<P> {
    pub fn new(
        platform: P,
        config: StreamConfig,
        render: Arc<RenderPath>,
        on_error: ErrorHandler,
    ) -> Self {
        Self {
            platform,
            config,
            render,
            on_error,
            handle: None,
        }
    }

    /// Builds and opens a new stream with the render and error callbacks wired
    /// in. Nothing is retained on failure.
    pub fn create_stream(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(StreamError::AlreadyOpen);
        }

        let mut builder = self.platform.create_builder().map_err(|e| {
            error!("Failed to create stream builder: {}", e);
            StreamError::Builder(e)
        })?;

        let stream = match self
            .platform
            .open_stream(&mut builder, &self.config, self.callbacks())
        {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to open stream: {}", e);
                if let Err(delete_err) = self.platform.delete_builder(builder) {
                    warn!("Failed to delete builder after open failure: {}", delete_err);
                }
                return Err(StreamError::Open(e));
            }
        };

        let sample_rate = stream.sample_rate();
        let channels = stream.channel_count();
        self.render
            .underruns()
            .reset(stream.buffer_size_in_frames(), stream.frames_per_burst());
        self.render.clock().set_format(sample_rate, channels);
        self.render.clock().set_state(stream.state());
        self.render.engine().configure(sample_rate, channels);

        info!(
            "Opened {} stream on {}: {}Hz, {} channels, {} frames (burst {})",
            self.platform.name(),
            stream.device_id(),
            sample_rate,
            channels,
            stream.buffer_size_in_frames(),
            stream.frames_per_burst()
        );

        self.handle = Some(StreamHandle { stream, builder });
        self.render.clock().set_stream_open(true);
        Ok(())
    }

    /// Closes the stream and deletes its builder. The handle is released even
    /// if either step fails. A no-op when nothing is open.
    pub fn destroy_stream(&mut self) -> Result<()> {
        let Some(StreamHandle {
            mut stream,
            builder,
        }) = self.handle.take()
        else {
            debug!("Destroy requested with no open stream");
            return Ok(());
        };
        self.render.clock().set_stream_open(false);

        let closed = stream.close().map_err(|e| {
            error!("Failed to close stream: {}", e);
            StreamError::Close(e)
        });
        drop(stream);

        let deleted = self.platform.delete_builder(builder).map_err(|e| {
            error!("Failed to delete stream builder: {}", e);
            StreamError::Delete(e)
        });

        self.render.clock().set_state(StreamState::Closed);
        debug!("Stream destroyed");
        closed.and(deleted)
    }

    pub fn stream(&self) -> Option<&P::Stream> {
        self.handle.as_ref().map(|handle| &handle.stream)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn clock(&self) -> &Arc<Clock> {
        self.render.clock()
    }

    fn callbacks(&self) -> StreamCallbacks {
        let render = Arc::clone(&self.render);
        let on_error = Arc::clone(&self.on_error);
        StreamCallbacks {
            data: Box::new(
                move |stream: &dyn CallbackStream, buffer: &mut [i16], frames: usize| {
                    render.on_audio_ready(stream, buffer, frames)
                },
            ),
            error: Box::new(move |error: NativeError| on_error(error)),
        }
    }
}

impl<P: AudioPlatform> Drop for StreamOwner<P> {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.destroy_stream();
        }
    }
}
