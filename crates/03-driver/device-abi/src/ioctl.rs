//! The closed set of bridged ioctl commands.
//!
//! Each command owns a typed payload. On the wire a command travels as its
//! request code (`i64`), the fixed structure as bytes and, for buffer
//! commands only, the count-prefixed plane array as a second bytes field.
//! Request codes outside this set are rejected before anything is sent.

use std::fmt;

use crate::error::{DeviceError, DeviceResult};
use crate::v4l2::{
    BufType, Buffer, Capability, Control, Event, ExtControls, Format, RequestBuffers, StreamParm,
};
use crate::wire::WireFormat;

/// Request codes, matching the Linux `VIDIOC_*` values.
pub mod request {
    pub const VIDIOC_QUERYCAP: u64 = 0x8068_5600;
    pub const VIDIOC_G_FMT: u64 = 0xc0d0_5604;
    pub const VIDIOC_S_FMT: u64 = 0xc0d0_5605;
    pub const VIDIOC_REQBUFS: u64 = 0xc014_5608;
    pub const VIDIOC_QUERYBUF: u64 = 0xc058_5609;
    pub const VIDIOC_QBUF: u64 = 0xc058_560f;
    pub const VIDIOC_DQBUF: u64 = 0xc058_5611;
    pub const VIDIOC_STREAMON: u64 = 0x4004_5612;
    pub const VIDIOC_STREAMOFF: u64 = 0x4004_5613;
    pub const VIDIOC_S_PARM: u64 = 0xc0cc_5616;
    pub const VIDIOC_G_CTRL: u64 = 0xc008_561b;
    pub const VIDIOC_S_EXT_CTRLS: u64 = 0xc020_5648;
    pub const VIDIOC_DQEVENT: u64 = 0x8088_5659;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ioctl {
    QueryCap(Capability),
    StreamOn(BufType),
    StreamOff(BufType),
    ReqBufs(RequestBuffers),
    QueryBuf(Buffer),
    QBuf(Buffer),
    DqBuf(Buffer),
    SFmt(Format),
    GFmt(Format),
    GCtrl(Control),
    DqEvent(Event),
    SExtCtrls(ExtControls),
    SParm(StreamParm),
}

/// Encoded ioctl argument or result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoctlPayload {
    pub request: u64,
    pub data: Vec<u8>,
    pub planes: Option<Vec<u8>>,
}

impl Ioctl {
    pub fn request(&self) -> u64 {
        use request::*;
        match self {
            Ioctl::QueryCap(_) => VIDIOC_QUERYCAP,
            Ioctl::StreamOn(_) => VIDIOC_STREAMON,
            Ioctl::StreamOff(_) => VIDIOC_STREAMOFF,
            Ioctl::ReqBufs(_) => VIDIOC_REQBUFS,
            Ioctl::QueryBuf(_) => VIDIOC_QUERYBUF,
            Ioctl::QBuf(_) => VIDIOC_QBUF,
            Ioctl::DqBuf(_) => VIDIOC_DQBUF,
            Ioctl::SFmt(_) => VIDIOC_S_FMT,
            Ioctl::GFmt(_) => VIDIOC_G_FMT,
            Ioctl::GCtrl(_) => VIDIOC_G_CTRL,
            Ioctl::DqEvent(_) => VIDIOC_DQEVENT,
            Ioctl::SExtCtrls(_) => VIDIOC_S_EXT_CTRLS,
            Ioctl::SParm(_) => VIDIOC_S_PARM,
        }
    }

    /// Whether `request` is one of the bridged commands.
    pub fn is_supported(request: u64) -> bool {
        use request::*;
        matches!(
            request,
            VIDIOC_QUERYCAP
                | VIDIOC_G_FMT
                | VIDIOC_S_FMT
                | VIDIOC_REQBUFS
                | VIDIOC_QUERYBUF
                | VIDIOC_QBUF
                | VIDIOC_DQBUF
                | VIDIOC_STREAMON
                | VIDIOC_STREAMOFF
                | VIDIOC_S_PARM
                | VIDIOC_G_CTRL
                | VIDIOC_S_EXT_CTRLS
                | VIDIOC_DQEVENT
        )
    }

    /// Buffer commands carry a plane array next to the fixed structure.
    pub fn has_planes(request: u64) -> bool {
        use request::*;
        matches!(request, VIDIOC_QUERYBUF | VIDIOC_QBUF | VIDIOC_DQBUF)
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match self {
            Ioctl::QueryBuf(buf) | Ioctl::QBuf(buf) | Ioctl::DqBuf(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut Buffer> {
        match self {
            Ioctl::QueryBuf(buf) | Ioctl::QBuf(buf) | Ioctl::DqBuf(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> IoctlPayload {
        let (data, planes) = match self {
            Ioctl::QueryCap(cap) => (cap.to_wire(), None),
            Ioctl::StreamOn(ty) | Ioctl::StreamOff(ty) => (ty.to_wire(), None),
            Ioctl::ReqBufs(req) => (req.to_wire(), None),
            Ioctl::QueryBuf(buf) | Ioctl::QBuf(buf) | Ioctl::DqBuf(buf) => {
                (buf.header_to_wire(), Some(buf.planes_to_wire()))
            }
            Ioctl::SFmt(fmt) | Ioctl::GFmt(fmt) => (fmt.to_wire(), None),
            Ioctl::GCtrl(ctrl) => (ctrl.to_wire(), None),
            Ioctl::DqEvent(event) => (event.to_wire(), None),
            Ioctl::SExtCtrls(ctrls) => (ctrls.to_wire(), None),
            Ioctl::SParm(parm) => (parm.to_wire(), None),
        };
        IoctlPayload {
            request: self.request(),
            data,
            planes,
        }
    }

    pub fn from_payload(payload: &IoctlPayload) -> DeviceResult<Self> {
        use request::*;
        let data = payload.data.as_slice();
        let planes = || {
            payload
                .planes
                .as_deref()
                .ok_or_else(|| DeviceError::protocol("buffer command without plane array"))
        };
        let cmd = match payload.request {
            VIDIOC_QUERYCAP => Ioctl::QueryCap(Capability::from_wire(data)?),
            VIDIOC_STREAMON => Ioctl::StreamOn(BufType::from_wire(data)?),
            VIDIOC_STREAMOFF => Ioctl::StreamOff(BufType::from_wire(data)?),
            VIDIOC_REQBUFS => Ioctl::ReqBufs(RequestBuffers::from_wire(data)?),
            VIDIOC_QUERYBUF => Ioctl::QueryBuf(Buffer::from_wire_parts(data, planes()?)?),
            VIDIOC_QBUF => Ioctl::QBuf(Buffer::from_wire_parts(data, planes()?)?),
            VIDIOC_DQBUF => Ioctl::DqBuf(Buffer::from_wire_parts(data, planes()?)?),
            VIDIOC_S_FMT => Ioctl::SFmt(Format::from_wire(data)?),
            VIDIOC_G_FMT => Ioctl::GFmt(Format::from_wire(data)?),
            VIDIOC_G_CTRL => Ioctl::GCtrl(Control::from_wire(data)?),
            VIDIOC_DQEVENT => Ioctl::DqEvent(Event::from_wire(data)?),
            VIDIOC_S_EXT_CTRLS => Ioctl::SExtCtrls(ExtControls::from_wire(data)?),
            VIDIOC_S_PARM => Ioctl::SParm(StreamParm::from_wire(data)?),
            other => return Err(unsupported(other)),
        };
        Ok(cmd)
    }

    /// Replaces `self` with `result` when both are the same command.
    pub fn update_from(&mut self, result: Ioctl) -> DeviceResult<()> {
        if result.request() != self.request() {
            return Err(DeviceError::protocol(format!(
                "reply carries {} for {}",
                IoctlName(result.request()),
                IoctlName(self.request())
            )));
        }
        *self = result;
        Ok(())
    }
}

pub fn unsupported(request: u64) -> DeviceError {
    DeviceError::protocol(format!("unsupported ioctl {}", IoctlName(request)))
}

/// Display helper printing the symbolic name of a request code.
pub struct IoctlName(pub u64);

impl fmt::Display for IoctlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use request::*;
        let name = match self.0 {
            VIDIOC_QUERYCAP => "VIDIOC_QUERYCAP",
            VIDIOC_G_FMT => "VIDIOC_G_FMT",
            VIDIOC_S_FMT => "VIDIOC_S_FMT",
            VIDIOC_REQBUFS => "VIDIOC_REQBUFS",
            VIDIOC_QUERYBUF => "VIDIOC_QUERYBUF",
            VIDIOC_QBUF => "VIDIOC_QBUF",
            VIDIOC_DQBUF => "VIDIOC_DQBUF",
            VIDIOC_STREAMON => "VIDIOC_STREAMON",
            VIDIOC_STREAMOFF => "VIDIOC_STREAMOFF",
            VIDIOC_S_PARM => "VIDIOC_S_PARM",
            VIDIOC_G_CTRL => "VIDIOC_G_CTRL",
            VIDIOC_S_EXT_CTRLS => "VIDIOC_S_EXT_CTRLS",
            VIDIOC_DQEVENT => "VIDIOC_DQEVENT",
            other => return write!(f, "{other:#x}"),
        };
        f.write_str(name)
    }
}
