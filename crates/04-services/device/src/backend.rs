//! Named vendor backends, resolved by library name at first `open`.
//!
//! Resolution is a lookup in factories registered in this process. Nothing
//! is loaded from disk: no `dlopen` happens, and a name with no registered
//! factory fails `open` as [`DeviceError::Exhausted`].

use std::collections::HashMap;
use std::sync::Arc;

use device_abi::{DeviceBackend, DeviceError, DeviceResult};
use log::{debug, warn};
use parking_lot::RwLock;

pub type BackendFactory = Arc<dyn Fn() -> Box<dyn DeviceBackend> + Send + Sync>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: RwLock<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `library`, replacing any earlier one.
    pub fn register<F>(&self, library: &str, factory: F)
    where
        F: Fn() -> Box<dyn DeviceBackend> + Send + Sync + 'static,
    {
        let previous = self
            .factories
            .write()
            .insert(library.to_owned(), Arc::new(factory));
        if previous.is_some() {
            warn!("backend {library} re-registered");
        }
    }

    pub fn contains(&self, library: &str) -> bool {
        self.factories.read().contains_key(library)
    }

    /// Builds a fresh backend from the factory registered as `library`.
    pub fn resolve(&self, library: &str) -> DeviceResult<Box<dyn DeviceBackend>> {
        let factory = self
            .factories
            .read()
            .get(library)
            .cloned()
            .ok_or_else(|| DeviceError::exhausted(format!("no backend named {library}")))?;
        debug!("resolved backend {library}");
        Ok(factory())
    }
}
