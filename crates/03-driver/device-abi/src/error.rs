//! Device error taxonomy and its wire status encoding.
//!
//! Every layer maps its low-level failures onto [`DeviceError`] at its own
//! boundary. On the wire a result travels as one `i32` status: `0` for
//! success, a reserved negative value for each bridge-level kind, and any
//! other value as a backend status passed through untouched.
//!
//! A backend status that falls inside the reserved range cannot travel
//! verbatim. It is sent as [`status::BACKEND_OUT_OF_RANGE`] instead, so the
//! caller still sees a backend failure, without the original value.

use thiserror::Error;

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Reserved wire statuses.
pub mod status {
    pub const OK: i32 = 0;
    pub const UNKNOWN_ERROR: i32 = i32::MIN;
    pub const PERMISSION_DENIED: i32 = i32::MIN + 1;
    pub const PROTOCOL_ERROR: i32 = i32::MIN + 2;
    pub const NO_RESOURCES: i32 = i32::MIN + 3;
    /// Stands in for a backend status that collides with the values above.
    pub const BACKEND_OUT_OF_RANGE: i32 = i32::MIN + 4;

    pub fn is_reserved(code: i32) -> bool {
        (UNKNOWN_ERROR..=NO_RESOURCES).contains(&code)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// No usable reply: the peer is gone, timed out, or rejected the call.
    #[error("bus failure: {0}")]
    Bus(String),

    /// The bus refused the call for access-control reasons.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Mismatched node id, unknown ioctl command, or malformed payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The real hardware operation failed with this status.
    #[error("backend returned status {0}")]
    Backend(i32),

    /// Ids, threads, or registrations ran out.
    #[error("resources exhausted: {0}")]
    Exhausted(String),
}

impl DeviceError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        DeviceError::Protocol(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        DeviceError::Bus(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        DeviceError::Exhausted(msg.into())
    }

    /// Wire status for this error.
    pub fn status(&self) -> i32 {
        match self {
            DeviceError::Bus(_) => status::UNKNOWN_ERROR,
            DeviceError::PermissionDenied(_) => status::PERMISSION_DENIED,
            DeviceError::Protocol(_) => status::PROTOCOL_ERROR,
            DeviceError::Exhausted(_) => status::NO_RESOURCES,
            DeviceError::Backend(code) if status::is_reserved(*code) => {
                status::BACKEND_OUT_OF_RANGE
            }
            DeviceError::Backend(code) => *code,
        }
    }

    /// Rebuilds an error from a non-zero wire status.
    pub fn from_status(code: i32) -> Self {
        match code {
            status::UNKNOWN_ERROR => DeviceError::bus("remote reported an unknown error"),
            status::PERMISSION_DENIED => {
                DeviceError::PermissionDenied("remote reported permission denied".into())
            }
            status::PROTOCOL_ERROR => DeviceError::protocol("remote rejected the call"),
            status::NO_RESOURCES => DeviceError::exhausted("remote ran out of resources"),
            other => DeviceError::Backend(other),
        }
    }
}

pub fn status_to_result(code: i32) -> DeviceResult<()> {
    if code == status::OK {
        Ok(())
    } else {
        Err(DeviceError::from_status(code))
    }
}

pub fn result_to_status<T>(result: &DeviceResult<T>) -> i32 {
    match result {
        Ok(_) => status::OK,
        Err(err) => err.status(),
    }
}
