//! Ioctl arguments and results as message fields.
//!
//! Call: `command:i64, struct:bytes[, planes:bytes]`.
//! Reply (after the status): `struct:bytes[, planes:bytes]`.

use device_abi::{unsupported, DeviceResult, Ioctl, IoctlPayload};
use transport::Message;

use crate::fields::DeviceFields;

pub fn append_ioctl(msg: &mut Message, cmd: &Ioctl) {
    msg.append_i64(cmd.request() as i64);
    append_ioctl_result(msg, cmd);
}

/// Appends the structure fields without the command code.
pub fn append_ioctl_result(msg: &mut Message, cmd: &Ioctl) {
    let payload = cmd.to_payload();
    msg.append_bytes(&payload.data);
    if let Some(planes) = &payload.planes {
        msg.append_bytes(planes);
    }
}

/// Reads a command. Unknown codes fail before any structure is read.
pub fn read_ioctl(msg: &mut Message) -> DeviceResult<Ioctl> {
    let request = msg.take_i64()? as u64;
    if !Ioctl::is_supported(request) {
        return Err(unsupported(request));
    }
    read_ioctl_result(msg, request)
}

pub fn read_ioctl_result(msg: &mut Message, request: u64) -> DeviceResult<Ioctl> {
    let data = msg.take_bytes()?;
    let planes = if Ioctl::has_planes(request) {
        Some(msg.take_bytes()?)
    } else {
        None
    };
    Ioctl::from_payload(&IoctlPayload {
        request,
        data,
        planes,
    })
}
