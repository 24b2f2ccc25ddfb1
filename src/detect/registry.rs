use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::result::RawDetection;
use crate::frame::Frame;

use super::backend::{DetectionCapability, DetectorBackend};

/// Registry of named detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<Mutex<dyn DetectorBackend>>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Warm up every registered backend.
    pub fn warm_up(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector backend '{}' lock poisoned", name))?;
            guard.warm_up()?;
        }
        Ok(())
    }

    /// Select a backend that supports the requested capability.
    ///
    /// Prefers the default backend when it supports the capability. Returns `None`
    /// when no backend offers it (e.g. no plate model is installed).
    pub fn backend_for_capability(
        &self,
        capability: DetectionCapability,
    ) -> Result<Option<Arc<Mutex<dyn DetectorBackend>>>> {
        if let Some(default_backend) = self.default_backend() {
            let supports = {
                let guard = default_backend
                    .lock()
                    .map_err(|_| anyhow!("default detector backend lock poisoned"))?;
                guard.supports(capability)
            };
            if supports {
                return Ok(Some(default_backend));
            }
        }

        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        for name in names {
            let backend = &self.backends[name];
            let supports = {
                let guard = backend
                    .lock()
                    .map_err(|_| anyhow!("detector backend lock poisoned"))?;
                guard.supports(capability)
            };
            if supports {
                return Ok(Some(backend.clone()));
            }
        }
        Ok(None)
    }

    /// Run detection using a backend that supports the requested capability.
    ///
    /// A missing capability yields an empty result rather than an error.
    pub fn detect_with_capability(
        &self,
        capability: DetectionCapability,
        frame: &Frame,
    ) -> Result<Vec<RawDetection>> {
        let Some(backend) = self.backend_for_capability(capability)? else {
            return Ok(Vec::new());
        };
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        guard.detect(capability, frame)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
