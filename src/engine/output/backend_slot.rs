//! Holds the one backend instance a host registers.
//!
//! The host calls [`BackendSlot::instantiate`] with the name it registered the
//! backend under, asks for the instance with [`BackendSlot::get_or_create`] as
//! often as it likes, and releases it with [`BackendSlot::deinstantiate`]. The
//! stream is torn down when the last handle to the instance is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::config::BackendConfig;
use crate::engine::output::output_manager::OutputManager;
use crate::engine::output::RenderEngine;
use crate::engine::platform::AudioPlatform;

struct SlotState<P: AudioPlatform> {
    instance_name: Option<String>,
    backend: Option<Arc<OutputManager<P>>>,
}

pub struct BackendSlot<P: AudioPlatform> {
    state: Mutex<SlotState<P>>,
}

impl<P: AudioPlatform> BackendSlot<P> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                instance_name: None,
                backend: None,
            }),
        }
    }

    /// Records the name the next created backend is registered under.
    pub fn instantiate(&self, instance_name: &str) {
        debug!("Backend instantiated as {}", instance_name);
        self.state.lock().instance_name = Some(instance_name.to_string());
    }

    /// Returns the existing backend, or builds one from the arguments.
    ///
    /// The arguments are dropped unused if a backend already exists.
    pub fn get_or_create(
        &self,
        platform: P,
        engine: Arc<dyn RenderEngine>,
        mut config: BackendConfig,
    ) -> Arc<OutputManager<P>> {
        let mut state = self.state.lock();
        if let Some(backend) = &state.backend {
            return Arc::clone(backend);
        }

        if let Some(name) = &state.instance_name {
            config.instance_name = name.clone();
        }
        info!("Creating backend instance {}", config.instance_name);
        let backend = Arc::new(OutputManager::new(platform, engine, config));
        state.backend = Some(Arc::clone(&backend));
        backend
    }

    pub fn get(&self) -> Option<Arc<OutputManager<P>>> {
        self.state.lock().backend.clone()
    }

    pub fn instance_name(&self) -> Option<String> {
        self.state.lock().instance_name.clone()
    }

    /// Releases the slot's reference to the backend and forgets the name.
    pub fn deinstantiate(&self) {
        let backend = {
            let mut state = self.state.lock();
            state.instance_name = None;
            state.backend.take()
        };
        if backend.is_some() {
            info!("Backend deinstantiated");
        }
        // Dropped outside the lock; this may tear the stream down.
        drop(backend);
    }
}

impl<P: AudioPlatform> Default for BackendSlot<P> {
    fn default() -> Self {
        Self::new()
    }
}
