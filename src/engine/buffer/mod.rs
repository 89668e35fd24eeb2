use std::sync::Arc;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    CachingCons, CachingProd, HeapRb,
};

/// Producer handle for the audio buffer. Used by the generator thread.
pub struct AudioBufferProducer {
    inner: CachingProd<Arc<HeapRb<i16>>>,
}

/// Consumer handle for the audio buffer. Used by the render callback.
pub struct AudioBufferConsumer {
    inner: CachingCons<Arc<HeapRb<i16>>>,
}

impl AudioBufferProducer {
    /// Pushes a slice of samples into the buffer.
    /// Returns the number of samples successfully pushed.
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        self.inner.push_slice(samples)
    }

    /// Returns the number of free spaces in the buffer.
    pub fn vacant_len(&self) -> usize {
        self.inner.vacant_len()
    }
}

impl AudioBufferConsumer {
    /// Pops samples into the provided slice without blocking.
    /// Returns the number of samples successfully popped.
    pub fn pop_slice(&mut self, samples: &mut [i16]) -> usize {
        self.inner.pop_slice(samples)
    }

    /// Returns the number of samples available in the buffer.
    pub fn occupied_len(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drops everything currently queued.
    pub fn clear(&mut self) -> usize {
        self.inner.clear()
    }
}

/// Creates a lock-free SPSC sample buffer with the specified capacity.
/// Returns a (Producer, Consumer) pair.
pub fn create_audio_buffer(capacity: usize) -> (AudioBufferProducer, AudioBufferConsumer) {
    let rb = HeapRb::<i16>::new(capacity);
    let (prod, cons) = rb.split();
    (
        AudioBufferProducer { inner: prod },
        AudioBufferConsumer { inner: cons },
    )
}
