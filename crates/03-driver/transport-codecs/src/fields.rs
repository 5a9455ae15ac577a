//! Positional field access with bridge error mapping.

use device_abi::{DeviceError, DeviceResult, NodeId};
use transport::{BusError, BusErrorKind, Message, TransportError};

/// Maps a bus failure onto the device taxonomy. Access-control rejections
/// keep their own kind; everything else is a generic bus failure.
pub fn map_bus_error(err: BusError) -> DeviceError {
    match err.kind {
        BusErrorKind::AccessDenied => DeviceError::PermissionDenied(err.text),
        _ => DeviceError::Bus(format!("{:?}: {}", err.kind, err.text)),
    }
}

pub fn map_field_error(err: TransportError) -> DeviceError {
    DeviceError::protocol(err.to_string())
}

/// Typed positional reads returning [`DeviceError::Protocol`] on mismatch.
pub trait DeviceFields {
    fn take_bool(&mut self) -> DeviceResult<bool>;
    fn take_i32(&mut self) -> DeviceResult<i32>;
    fn take_i64(&mut self) -> DeviceResult<i64>;
    fn take_str(&mut self) -> DeviceResult<String>;
    fn take_bytes(&mut self) -> DeviceResult<Vec<u8>>;
    fn take_node_id(&mut self) -> DeviceResult<NodeId>;
}

impl DeviceFields for Message {
    fn take_bool(&mut self) -> DeviceResult<bool> {
        self.read_bool().map_err(map_field_error)
    }

    fn take_i32(&mut self) -> DeviceResult<i32> {
        self.read_i32().map_err(map_field_error)
    }

    fn take_i64(&mut self) -> DeviceResult<i64> {
        self.read_i64().map_err(map_field_error)
    }

    fn take_str(&mut self) -> DeviceResult<String> {
        self.read_str().map_err(map_field_error)
    }

    fn take_bytes(&mut self) -> DeviceResult<Vec<u8>> {
        self.read_bytes().map_err(map_field_error)
    }

    fn take_node_id(&mut self) -> DeviceResult<NodeId> {
        self.take_i32().map(NodeId::from_wire)
    }
}
