//! Buffer slot keys and shared segment naming.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use device_abi::{DeviceError, DeviceResult, Port};
use transport::{SharedSegment, TransportError};

/// One plane of one buffer slot on one port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferKey {
    pub port: Port,
    pub index: u32,
    pub plane: u32,
}

impl BufferKey {
    pub fn new(port: Port, index: u32, plane: u32) -> Self {
        Self { port, index, plane }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?},{},{})", self.port, self.index, self.plane)
    }
}

/// Names a shared segment across the process boundary.
///
/// The high half is the creating process id, the low half a per-process
/// sequence number, so tokens never collide between live processes. In
/// user-pointer mode the token travels in place of the pointer value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentToken(pub u64);

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(1);

impl SegmentToken {
    pub fn next() -> Self {
        let seq = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
        SegmentToken((u64::from(std::process::id()) << 32) | u64::from(seq))
    }

    pub fn segment_name(self) -> String {
        format!("vdev-{}-{}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

pub(crate) fn segment_error(err: TransportError) -> DeviceError {
    match err {
        TransportError::SegmentCreate { .. } => DeviceError::exhausted(err.to_string()),
        other => DeviceError::protocol(other.to_string()),
    }
}

pub(crate) fn create_segment(dir: &Path, size: usize) -> DeviceResult<(SegmentToken, SharedSegment)> {
    let token = SegmentToken::next();
    let segment = SharedSegment::create(dir, &token.segment_name(), size).map_err(segment_error)?;
    Ok((token, segment))
}

pub(crate) fn attach_segment(dir: &Path, name: &str) -> DeviceResult<SharedSegment> {
    SharedSegment::attach(dir, name).map_err(segment_error)
}

/// Bytes of a plane worth copying: the used part if the driver reported
/// one, else the whole plane.
pub(crate) fn copy_len(bytes_used: u32, length: u32, limit: usize) -> usize {
    let wanted = if bytes_used > 0 { bytes_used } else { length };
    (wanted as usize).min(limit)
}
