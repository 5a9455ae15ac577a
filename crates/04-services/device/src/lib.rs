//! The device bridge proper.
//!
//! Client side: [`VideoDeviceClient`] obtains a node id from the directory
//! and resolves `VideoDevice.<id>` into a [`DeviceProxy`], which implements
//! [`VideoDevice`](device_abi::VideoDevice) over the bus and keeps the client
//! buffer map. Server side: [`DeviceFactory`] builds a [`DeviceInstance`] per
//! id and publishes it through a [`DeviceAdaptor`], which serves calls,
//! bridges buffer memory through shared segments and cleans up when its
//! client disconnects.

mod adaptor;
mod backend;
mod client_map;
mod instance;
mod proxy;
mod segments;
mod server;
mod server_map;
mod session;

pub use adaptor::DeviceAdaptor;
pub use backend::{BackendFactory, BackendRegistry};
pub use client_map::{ClientBufferMap, ClientEntry};
pub use instance::DeviceInstance;
pub use proxy::DeviceProxy;
pub use segments::{BufferKey, SegmentToken};
pub use server::{DeviceFactory, DeviceServer};
pub use server_map::{Mapping, ServerBufferMap, ServerEntry};
pub use session::VideoDeviceClient;
