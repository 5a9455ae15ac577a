//! Mock codec backend for the device bridge.
//!
//! [`install`] registers a factory under a library name; every backend it
//! builds is recorded so tests and the demo can inspect what the "hardware"
//! saw through a [`MockHandle`].

mod backend;

use std::sync::Arc;

use device_abi::Event;
use parking_lot::Mutex;
use services_device::BackendRegistry;

pub use backend::{
    eos_event, errno, MockCodecBackend, CID_MIN_BUFFERS_FOR_CAPTURE, DEFAULT_PLANE_SIZE,
    MAX_BUFFERS,
};

use backend::MockState;

/// Inspection handle for one mock backend.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn is_open(&self) -> bool {
        self.state.lock().open_name.is_some()
    }

    pub fn open_name(&self) -> Option<String> {
        self.state.lock().open_name.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Commands that reached the backend.
    pub fn ioctl_count(&self) -> usize {
        self.state.lock().ioctl_count
    }

    pub fn requests(&self) -> Vec<u64> {
        self.state.lock().requests.clone()
    }

    /// Frames read from output buffers, in queue order.
    pub fn observed_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().observed.clone()
    }

    pub fn mapped_count(&self) -> usize {
        self.state.lock().mapped_count()
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.state.lock().params.get(key).cloned()
    }

    pub fn push_event(&self, event: Event) {
        self.state.lock().events.push_back(event);
    }

    /// Makes the next `ioctl` fail with `code` before it is processed.
    pub fn fail_next_ioctl(&self, code: i32) {
        self.state.lock().fail_next = Some(code);
    }
}

/// Every backend built by an installed factory, in creation order.
#[derive(Clone, Default)]
pub struct MockBackends {
    handles: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockBackends {
    pub fn handles(&self) -> Vec<MockHandle> {
        self.handles.lock().clone()
    }

    pub fn latest(&self) -> Option<MockHandle> {
        self.handles.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// Registers the mock under `library` in `registry`.
pub fn install(registry: &BackendRegistry, library: &str) -> MockBackends {
    let backends = MockBackends::default();
    let created = backends.clone();
    registry.register(library, move || {
        let state = Arc::new(Mutex::new(MockState::default()));
        created.handles.lock().push(MockHandle {
            state: Arc::clone(&state),
        });
        Box::new(MockCodecBackend::new(state))
    });
    backends
}
