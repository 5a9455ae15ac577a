//! Call conventions for the device bridge.
//!
//! [`CallCodec`] wraps one remote object: build a call, append positional
//! fields, send it with the configured timeout, and read the status first.
//! Bus failures are mapped onto [`device_abi::DeviceError`] here, so nothing
//! above this crate sees raw bus errors.

mod call;
mod fields;
mod ioctl;

pub use call::{reply_status, reply_with, CallCodec};
pub use fields::{map_bus_error, map_field_error, DeviceFields};
pub use ioctl::{append_ioctl, append_ioctl_result, read_ioctl, read_ioctl_result};
