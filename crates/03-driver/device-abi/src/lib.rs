//! Contract types shared by both sides of the device bridge.
//!
//! Nothing here talks to the bus. The crate defines node identities, the
//! error taxonomy and its status codes, the V4L2-modelled control structures
//! with their explicit wire layouts, the closed [`Ioctl`] command set, the
//! [`VideoDevice`] contract, the [`DeviceBackend`] vendor table, and
//! [`BridgeConfig`].

mod config;
mod device;
mod error;
mod id;
mod ioctl;
mod protocol;
mod v4l2;
mod wire;

pub use config::{BridgeConfig, ConfigError, ENV_BACKEND, ENV_CALL_TIMEOUT_MS, ENV_SHM_DIR};
pub use device::{map_flags, prot, BackendResult, DeviceBackend, VideoDevice};
pub use error::{result_to_status, status, status_to_result, DeviceError, DeviceResult};
pub use id::NodeId;
pub use ioctl::{request, unsupported, Ioctl, IoctlName, IoctlPayload};
pub use protocol::{device_methods, directory_methods, DEVICE_SERVICE, DIRECTORY_SERVICE};
pub use v4l2::{
    event_kind, BufType, Buffer, Capability, Control, Event, ExtControl, ExtControls, Format,
    MemoryType, Plane, PlaneFormat, PlaneMemory, Planes, Port, RequestBuffers, StreamParm,
    MAX_PLANES,
};
pub use wire::{WireFormat, WireReader, WireWriter};
