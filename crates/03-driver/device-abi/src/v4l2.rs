//! Control structures modelled on Video4Linux2, with their wire layouts.

use smallvec::SmallVec;

use crate::error::{DeviceError, DeviceResult};
use crate::wire::{WireFormat, WireReader, WireWriter};

/// Upper bound on planes per buffer.
pub const MAX_PLANES: usize = 8;

/// Stream direction. `Output` feeds the device (bitstream in), `Capture`
/// drains it (frames out).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Port {
    Output,
    Capture,
}

impl Port {
    pub fn raw(self) -> i32 {
        match self {
            Port::Output => 0,
            Port::Capture => 1,
        }
    }

    pub fn from_raw(raw: i32) -> DeviceResult<Self> {
        match raw {
            0 => Ok(Port::Output),
            1 => Ok(Port::Capture),
            other => Err(DeviceError::protocol(format!("unknown port {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufType {
    VideoCapture,
    VideoOutput,
    VideoCaptureMplane,
    VideoOutputMplane,
}

impl BufType {
    pub fn raw(self) -> u32 {
        match self {
            BufType::VideoCapture => 1,
            BufType::VideoOutput => 2,
            BufType::VideoCaptureMplane => 9,
            BufType::VideoOutputMplane => 10,
        }
    }

    pub fn from_raw(raw: u32) -> DeviceResult<Self> {
        match raw {
            1 => Ok(BufType::VideoCapture),
            2 => Ok(BufType::VideoOutput),
            9 => Ok(BufType::VideoCaptureMplane),
            10 => Ok(BufType::VideoOutputMplane),
            other => Err(DeviceError::protocol(format!("unknown buffer type {other}"))),
        }
    }

    pub fn port(self) -> Port {
        match self {
            BufType::VideoOutput | BufType::VideoOutputMplane => Port::Output,
            BufType::VideoCapture | BufType::VideoCaptureMplane => Port::Capture,
        }
    }

    pub fn is_multiplanar(self) -> bool {
        matches!(
            self,
            BufType::VideoCaptureMplane | BufType::VideoOutputMplane
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Mmap,
    UserPtr,
    DmaBuf,
}

impl MemoryType {
    pub fn raw(self) -> u32 {
        match self {
            MemoryType::Mmap => 1,
            MemoryType::UserPtr => 2,
            MemoryType::DmaBuf => 4,
        }
    }

    pub fn from_raw(raw: u32) -> DeviceResult<Self> {
        match raw {
            1 => Ok(MemoryType::Mmap),
            2 => Ok(MemoryType::UserPtr),
            4 => Ok(MemoryType::DmaBuf),
            other => Err(DeviceError::protocol(format!("unknown memory type {other}"))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
}

impl WireFormat for Capability {
    fn encode(&self, w: &mut WireWriter) {
        w.put_str(&self.driver)
            .put_str(&self.card)
            .put_str(&self.bus_info)
            .put_u32(self.version)
            .put_u32(self.capabilities)
            .put_u32(self.device_caps);
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        Ok(Self {
            driver: r.get_str()?,
            card: r.get_str()?,
            bus_info: r.get_str()?,
            version: r.get_u32()?,
            capabilities: r.get_u32()?,
            device_caps: r.get_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestBuffers {
    pub count: u32,
    pub buf_type: BufType,
    pub memory: MemoryType,
    pub capabilities: u32,
}

impl WireFormat for RequestBuffers {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.count)
            .put_u32(self.buf_type.raw())
            .put_u32(self.memory.raw())
            .put_u32(self.capabilities);
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        Ok(Self {
            count: r.get_u32()?,
            buf_type: BufType::from_raw(r.get_u32()?)?,
            memory: MemoryType::from_raw(r.get_u32()?)?,
            capabilities: r.get_u32()?,
        })
    }
}

/// Where a plane's memory lives; which variant is valid follows the buffer's memory type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneMemory {
    MemOffset(u32),
    UserPtr(u64),
    Fd(i32),
}

impl PlaneMemory {
    fn encode(&self, w: &mut WireWriter) {
        match *self {
            PlaneMemory::MemOffset(offset) => w.put_u8(1).put_u64(u64::from(offset)),
            PlaneMemory::UserPtr(ptr) => w.put_u8(2).put_u64(ptr),
            PlaneMemory::Fd(fd) => w.put_u8(4).put_u64(fd as u32 as u64),
        };
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        let tag = r.get_u8()?;
        let raw = r.get_u64()?;
        match tag {
            1 => Ok(PlaneMemory::MemOffset(raw as u32)),
            2 => Ok(PlaneMemory::UserPtr(raw)),
            4 => Ok(PlaneMemory::Fd(raw as u32 as i32)),
            other => Err(DeviceError::protocol(format!("unknown plane memory tag {other}"))),
        }
    }

    pub fn mem_offset(&self) -> Option<u32> {
        match *self {
            PlaneMemory::MemOffset(offset) => Some(offset),
            _ => None,
        }
    }

    pub fn user_ptr(&self) -> Option<u64> {
        match *self {
            PlaneMemory::UserPtr(ptr) => Some(ptr),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plane {
    pub bytes_used: u32,
    pub length: u32,
    pub m: PlaneMemory,
    pub data_offset: u32,
}

impl Plane {
    pub fn new(length: u32, m: PlaneMemory) -> Self {
        Self {
            bytes_used: 0,
            length,
            m,
            data_offset: 0,
        }
    }
}

pub type Planes = SmallVec<[Plane; 4]>;

/// A buffer descriptor. Single-planar buffer types carry exactly one plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    pub index: u32,
    pub buf_type: BufType,
    pub memory: MemoryType,
    pub bytes_used: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp_us: i64,
    pub sequence: u32,
    pub planes: Planes,
}

impl Buffer {
    pub fn new(buf_type: BufType, memory: MemoryType, index: u32) -> Self {
        Self {
            index,
            buf_type,
            memory,
            bytes_used: 0,
            flags: 0,
            field: 0,
            timestamp_us: 0,
            sequence: 0,
            planes: Planes::new(),
        }
    }

    pub fn with_planes(mut self, planes: impl IntoIterator<Item = Plane>) -> Self {
        self.planes = planes.into_iter().collect();
        self
    }

    pub fn port(&self) -> Port {
        self.buf_type.port()
    }

    /// Fixed part of the descriptor, without planes.
    pub fn header_to_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.index)
            .put_u32(self.buf_type.raw())
            .put_u32(self.memory.raw())
            .put_u32(self.bytes_used)
            .put_u32(self.flags)
            .put_u32(self.field)
            .put_i64(self.timestamp_us)
            .put_u32(self.sequence);
        w.finish()
    }

    /// Count-prefixed plane array.
    pub fn planes_to_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.planes.len() as u32);
        for plane in &self.planes {
            w.put_u32(plane.bytes_used)
                .put_u32(plane.length)
                .put_u32(plane.data_offset);
            plane.m.encode(&mut w);
        }
        w.finish()
    }

    pub fn from_wire_parts(header: &[u8], planes: &[u8]) -> DeviceResult<Self> {
        let mut r = WireReader::new(header);
        let mut buffer = Self {
            index: r.get_u32()?,
            buf_type: BufType::from_raw(r.get_u32()?)?,
            memory: MemoryType::from_raw(r.get_u32()?)?,
            bytes_used: r.get_u32()?,
            flags: r.get_u32()?,
            field: r.get_u32()?,
            timestamp_us: r.get_i64()?,
            sequence: r.get_u32()?,
            planes: Planes::new(),
        };
        r.finish()?;

        let mut r = WireReader::new(planes);
        let count = r.get_u32()? as usize;
        if count == 0 || count > MAX_PLANES {
            return Err(DeviceError::protocol(format!("invalid plane count {count}")));
        }
        for _ in 0..count {
            let bytes_used = r.get_u32()?;
            let length = r.get_u32()?;
            let data_offset = r.get_u32()?;
            let m = PlaneMemory::decode(&mut r)?;
            buffer.planes.push(Plane {
                bytes_used,
                length,
                m,
                data_offset,
            });
        }
        r.finish()?;
        Ok(buffer)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub size_image: u32,
    pub bytes_per_line: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Format {
    pub buf_type: BufType,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub field: u32,
    pub colorspace: u32,
    pub planes: SmallVec<[PlaneFormat; 4]>,
}

impl Format {
    pub fn new(buf_type: BufType, width: u32, height: u32, pixel_format: u32) -> Self {
        Self {
            buf_type,
            width,
            height,
            pixel_format,
            field: 0,
            colorspace: 0,
            planes: SmallVec::new(),
        }
    }

    /// Planes per buffer implied by this format.
    pub fn plane_count(&self) -> usize {
        if self.buf_type.is_multiplanar() {
            self.planes.len().max(1)
        } else {
            1
        }
    }
}

impl WireFormat for Format {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.buf_type.raw())
            .put_u32(self.width)
            .put_u32(self.height)
            .put_u32(self.pixel_format)
            .put_u32(self.field)
            .put_u32(self.colorspace)
            .put_u32(self.planes.len() as u32);
        for plane in &self.planes {
            w.put_u32(plane.size_image).put_u32(plane.bytes_per_line);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        let mut format = Self {
            buf_type: BufType::from_raw(r.get_u32()?)?,
            width: r.get_u32()?,
            height: r.get_u32()?,
            pixel_format: r.get_u32()?,
            field: r.get_u32()?,
            colorspace: r.get_u32()?,
            planes: SmallVec::new(),
        };
        let count = r.get_u32()? as usize;
        if count > MAX_PLANES {
            return Err(DeviceError::protocol(format!("invalid plane count {count}")));
        }
        for _ in 0..count {
            format.planes.push(PlaneFormat {
                size_image: r.get_u32()?,
                bytes_per_line: r.get_u32()?,
            });
        }
        Ok(format)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Control {
    pub id: u32,
    pub value: i32,
}

impl WireFormat for Control {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.id).put_i32(self.value);
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        Ok(Self {
            id: r.get_u32()?,
            value: r.get_i32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtControl {
    pub id: u32,
    pub value: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtControls {
    pub which: u32,
    pub error_idx: u32,
    pub controls: Vec<ExtControl>,
}

impl WireFormat for ExtControls {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.which)
            .put_u32(self.error_idx)
            .put_u32(self.controls.len() as u32);
        for ctrl in &self.controls {
            w.put_u32(ctrl.id).put_i64(ctrl.value);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        let which = r.get_u32()?;
        let error_idx = r.get_u32()?;
        let count = r.get_u32()? as usize;
        let mut controls = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            controls.push(ExtControl {
                id: r.get_u32()?,
                value: r.get_i64()?,
            });
        }
        Ok(Self {
            which,
            error_idx,
            controls,
        })
    }
}

/// Event kinds reported through `DQEVENT`.
pub mod event_kind {
    pub const EOS: u32 = 2;
    pub const SOURCE_CHANGE: u32 = 5;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub kind: u32,
    pub changes: u32,
    pub pending: u32,
    pub sequence: u32,
    pub id: u32,
    pub timestamp_us: i64,
}

impl WireFormat for Event {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.kind)
            .put_u32(self.changes)
            .put_u32(self.pending)
            .put_u32(self.sequence)
            .put_u32(self.id)
            .put_i64(self.timestamp_us);
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        Ok(Self {
            kind: r.get_u32()?,
            changes: r.get_u32()?,
            pending: r.get_u32()?,
            sequence: r.get_u32()?,
            id: r.get_u32()?,
            timestamp_us: r.get_i64()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParm {
    pub buf_type: BufType,
    pub capability: u32,
    pub time_per_frame_num: u32,
    pub time_per_frame_den: u32,
}

impl WireFormat for StreamParm {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.buf_type.raw())
            .put_u32(self.capability)
            .put_u32(self.time_per_frame_num)
            .put_u32(self.time_per_frame_den);
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        Ok(Self {
            buf_type: BufType::from_raw(r.get_u32()?)?,
            capability: r.get_u32()?,
            time_per_frame_num: r.get_u32()?,
            time_per_frame_den: r.get_u32()?,
        })
    }
}

impl WireFormat for BufType {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(self.raw());
    }

    fn decode(r: &mut WireReader<'_>) -> DeviceResult<Self> {
        BufType::from_raw(r.get_u32()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_type_determines_port() {
        assert_eq!(BufType::VideoOutputMplane.port(), Port::Output);
        assert_eq!(BufType::VideoCapture.port(), Port::Capture);
        assert!(BufType::VideoCaptureMplane.is_multiplanar());
    }

    #[test]
    fn buffer_planes_travel_count_prefixed() {
        let buffer = Buffer::new(BufType::VideoCaptureMplane, MemoryType::UserPtr, 2).with_planes([
            Plane::new(4096, PlaneMemory::UserPtr(0x1000)),
            Plane::new(2048, PlaneMemory::UserPtr(0x9000)),
        ]);
        let planes = buffer.planes_to_wire();
        assert_eq!(&planes[..4], &2u32.to_le_bytes());

        let decoded = Buffer::from_wire_parts(&buffer.header_to_wire(), &planes).unwrap();
        assert_eq!(decoded, buffer);
    }

    #[test]
    fn zero_planes_are_rejected() {
        let buffer = Buffer::new(BufType::VideoOutput, MemoryType::Mmap, 0);
        assert!(matches!(
            Buffer::from_wire_parts(&buffer.header_to_wire(), &buffer.planes_to_wire()),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn single_planar_format_has_one_plane() {
        let mut format = Format::new(BufType::VideoOutput, 640, 480, 0x3436_3248);
        assert_eq!(format.plane_count(), 1);
        format.buf_type = BufType::VideoCaptureMplane;
        format.planes.push(PlaneFormat::default());
        format.planes.push(PlaneFormat::default());
        assert_eq!(format.plane_count(), 2);
    }
}
