//! In-memory loopback decoder.
//!
//! Every frame queued on the output port is recorded and handed back, byte
//! for byte, on the next capture dequeue. Mapped buffers live on the heap;
//! their offsets encode `(port, index, plane)`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use device_abi::{
    event_kind, BackendResult, BufType, Buffer, Capability, DeviceBackend, Event, Format, Ioctl,
    MemoryType, Plane, PlaneFormat, PlaneMemory, Port, RequestBuffers,
};
use log::{debug, trace};
use parking_lot::Mutex;

pub mod errno {
    pub const ENOENT: i32 = -2;
    pub const EAGAIN: i32 = -11;
    pub const EBUSY: i32 = -16;
    pub const EINVAL: i32 = -22;
}

/// Control reporting how many capture buffers the decoder needs.
pub const CID_MIN_BUFFERS_FOR_CAPTURE: u32 = 0x0098_0927;

pub const DEFAULT_PLANE_SIZE: u32 = 64 * 1024;
pub const MAX_BUFFERS: u32 = 32;

const PORT_SHIFT: u32 = 28;
const INDEX_SHIFT: u32 = 20;
const PLANE_SHIFT: u32 = 12;

fn mem_offset(port: Port, index: u32, plane: u32) -> u32 {
    ((port.raw() as u32) << PORT_SHIFT) | (index << INDEX_SHIFT) | (plane << PLANE_SHIFT)
}

fn decode_offset(offset: u32) -> BackendResult<(Port, u32, u32)> {
    let port = Port::from_raw((offset >> PORT_SHIFT) as i32).map_err(|_| errno::EINVAL)?;
    let index = (offset >> INDEX_SHIFT) & 0xff;
    let plane = (offset >> PLANE_SHIFT) & 0xff;
    Ok((port, index, plane))
}

struct Slot {
    /// Heap storage, present for mapped buffers.
    storage: Vec<Box<[u8]>>,
    /// Planes as last queued; user-pointer buffers hand these back on dequeue.
    queued_planes: Vec<Plane>,
    bytes_used: u32,
}

#[derive(Default)]
struct PortState {
    buf_type: Option<BufType>,
    memory: Option<MemoryType>,
    slots: Vec<Slot>,
    queue: VecDeque<u32>,
    streaming: bool,
    mapped: usize,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub(crate) open_name: Option<String>,
    pub(crate) open_count: usize,
    pub(crate) ioctl_count: usize,
    pub(crate) requests: Vec<u64>,
    pub(crate) observed: Vec<Vec<u8>>,
    pub(crate) params: HashMap<String, String>,
    pub(crate) fail_next: Option<i32>,
    pub(crate) events: VecDeque<Event>,
    pub(crate) poll_interrupt: bool,
    controls: HashMap<u32, i64>,
    formats: HashMap<Port, Format>,
    ports: HashMap<Port, PortState>,
    pending_frames: VecDeque<Vec<u8>>,
    mappings: HashMap<usize, (Port, u32, u32, usize)>,
    sequence: u32,
}

impl MockState {
    pub(crate) fn mapped_count(&self) -> usize {
        self.mappings.len()
    }

    fn port(&mut self, port: Port) -> &mut PortState {
        self.ports.entry(port).or_default()
    }

    fn format(&self, buf_type: BufType) -> Format {
        self.formats
            .get(&buf_type.port())
            .cloned()
            .unwrap_or_else(|| default_format(buf_type))
    }

    fn plane_sizes(&self, buf_type: BufType) -> Vec<u32> {
        let format = self.format(buf_type);
        (0..format.plane_count())
            .map(|i| {
                format
                    .planes
                    .get(i)
                    .map(|p| p.size_image)
                    .filter(|size| *size > 0)
                    .unwrap_or(DEFAULT_PLANE_SIZE)
            })
            .collect()
    }

    fn set_format(&mut self, format: &mut Format) {
        if format.planes.is_empty() {
            format.planes.push(PlaneFormat::default());
        }
        for plane in format.planes.iter_mut() {
            if plane.size_image == 0 {
                plane.size_image = DEFAULT_PLANE_SIZE;
            }
        }
        self.formats.insert(format.buf_type.port(), format.clone());
    }

    fn request_buffers(&mut self, req: &mut RequestBuffers) -> BackendResult<()> {
        let sizes = self.plane_sizes(req.buf_type);
        let port = self.port(req.buf_type.port());
        if port.mapped > 0 {
            return Err(errno::EBUSY);
        }
        let count = req.count.min(MAX_BUFFERS);
        port.buf_type = Some(req.buf_type);
        port.memory = Some(req.memory);
        port.queue.clear();
        port.streaming = false;
        port.slots = (0..count)
            .map(|_| Slot {
                storage: match req.memory {
                    MemoryType::Mmap => sizes
                        .iter()
                        .map(|size| vec![0u8; *size as usize].into_boxed_slice())
                        .collect(),
                    _ => Vec::new(),
                },
                queued_planes: Vec::new(),
                bytes_used: 0,
            })
            .collect();
        req.count = count;
        Ok(())
    }

    fn query_buffer(&mut self, buf: &mut Buffer) -> BackendResult<()> {
        let sizes = self.plane_sizes(buf.buf_type);
        let port_id = buf.port();
        let port = self.port(port_id);
        if buf.index as usize >= port.slots.len() {
            return Err(errno::EINVAL);
        }
        let memory = port.memory.unwrap_or(MemoryType::Mmap);
        buf.memory = memory;
        buf.planes = sizes
            .iter()
            .enumerate()
            .map(|(plane, size)| {
                let m = match memory {
                    MemoryType::Mmap => {
                        PlaneMemory::MemOffset(mem_offset(port_id, buf.index, plane as u32))
                    }
                    MemoryType::UserPtr => PlaneMemory::UserPtr(0),
                    MemoryType::DmaBuf => PlaneMemory::Fd(-1),
                };
                Plane::new(*size, m)
            })
            .collect();
        Ok(())
    }

    fn queue_buffer(&mut self, buf: &mut Buffer) -> BackendResult<()> {
        let port_id = buf.port();
        let port = self.port(port_id);
        let Some(slot) = port.slots.get_mut(buf.index as usize) else {
            return Err(errno::EINVAL);
        };
        if port.memory != Some(buf.memory) {
            return Err(errno::EINVAL);
        }
        slot.queued_planes = buf.planes.to_vec();
        if port_id == Port::Output {
            let mut frame = Vec::new();
            for (plane_index, plane) in buf.planes.iter().enumerate() {
                let used = plane.bytes_used.min(plane.length) as usize;
                match (buf.memory, plane.m) {
                    (MemoryType::Mmap, _) => {
                        let storage = slot.storage.get(plane_index).ok_or(errno::EINVAL)?;
                        frame.extend_from_slice(&storage[..used.min(storage.len())]);
                    }
                    (MemoryType::UserPtr, PlaneMemory::UserPtr(ptr)) if ptr != 0 => {
                        // SAFETY: a queued user-pointer plane is readable for
                        // its length during this call.
                        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, used) };
                        frame.extend_from_slice(bytes);
                    }
                    _ => return Err(errno::EINVAL),
                }
            }
            slot.bytes_used = frame.len() as u32;
            trace!("mock consumed {} bytes from output {}", frame.len(), buf.index);
            self.observed.push(frame.clone());
            self.pending_frames.push_back(frame);
        }
        let port = self.port(port_id);
        port.queue.push_back(buf.index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, buf: &mut Buffer) -> BackendResult<()> {
        let port_id = buf.port();
        if port_id == Port::Capture && self.pending_frames.is_empty() {
            return Err(errno::EAGAIN);
        }
        let sizes = self.plane_sizes(buf.buf_type);
        let frame = if port_id == Port::Capture {
            self.pending_frames.pop_front()
        } else {
            None
        };
        self.sequence += 1;
        let sequence = self.sequence;
        let port = self.port(port_id);
        let Some(index) = port.queue.pop_front() else {
            if let Some(frame) = frame {
                self.pending_frames.push_front(frame);
            }
            return Err(errno::EAGAIN);
        };
        let memory = port.memory.unwrap_or(MemoryType::Mmap);
        let slot = port.slots.get_mut(index as usize).ok_or(errno::EINVAL)?;

        let mut planes: Vec<Plane> = match memory {
            MemoryType::Mmap => sizes
                .iter()
                .enumerate()
                .map(|(plane, size)| {
                    Plane::new(*size, PlaneMemory::MemOffset(mem_offset(port_id, index, plane as u32)))
                })
                .collect(),
            _ => slot.queued_planes.clone(),
        };
        if planes.is_empty() {
            planes.push(Plane::new(sizes.first().copied().unwrap_or(DEFAULT_PLANE_SIZE), PlaneMemory::UserPtr(0)));
        }

        match frame {
            Some(frame) => {
                // The whole frame lands in the first plane.
                let plane = &mut planes[0];
                let n = frame.len().min(plane.length as usize);
                match (memory, plane.m) {
                    (MemoryType::Mmap, _) => {
                        if let Some(storage) = slot.storage.first_mut() {
                            storage[..n].copy_from_slice(&frame[..n]);
                        }
                    }
                    (MemoryType::UserPtr, PlaneMemory::UserPtr(ptr)) if ptr != 0 => {
                        // SAFETY: a queued capture plane stays writable for its
                        // length until it is dequeued.
                        unsafe {
                            std::ptr::copy_nonoverlapping(frame.as_ptr(), ptr as *mut u8, n);
                        }
                    }
                    _ => {}
                }
                plane.bytes_used = n as u32;
                buf.bytes_used = n as u32;
            }
            None => {
                if let Some(plane) = planes.first_mut() {
                    plane.bytes_used = slot.bytes_used;
                }
                buf.bytes_used = slot.bytes_used;
            }
        }
        buf.index = index;
        buf.memory = memory;
        buf.sequence = sequence;
        buf.planes = planes.into_iter().collect();
        Ok(())
    }

    fn map(&mut self, length: usize, offset: u32) -> BackendResult<usize> {
        let (port_id, index, plane) = decode_offset(offset)?;
        let port = self.port(port_id);
        let storage = port
            .slots
            .get_mut(index as usize)
            .and_then(|slot| slot.storage.get_mut(plane as usize))
            .ok_or(errno::EINVAL)?;
        if length > storage.len() {
            return Err(errno::EINVAL);
        }
        let addr = storage.as_mut_ptr() as usize;
        port.mapped += 1;
        self.mappings.insert(addr, (port_id, index, plane, length));
        debug!("mock mapped {port_id:?}/{index}/{plane} at {addr:#x}");
        Ok(addr)
    }

    fn unmap(&mut self, addr: usize) -> BackendResult<()> {
        let (port_id, ..) = self.mappings.remove(&addr).ok_or(errno::EINVAL)?;
        let port = self.port(port_id);
        port.mapped = port.mapped.saturating_sub(1);
        Ok(())
    }

    fn handle(&mut self, cmd: &mut Ioctl) -> BackendResult<()> {
        match cmd {
            Ioctl::QueryCap(cap) => {
                *cap = Capability {
                    driver: "vdev-mock".into(),
                    card: "mock loopback decoder".into(),
                    bus_info: "platform:mock".into(),
                    version: 1,
                    capabilities: 0x8420_4000,
                    device_caps: 0x0420_4000,
                };
                Ok(())
            }
            Ioctl::SFmt(format) => {
                self.set_format(format);
                Ok(())
            }
            Ioctl::GFmt(format) => {
                *format = self.format(format.buf_type);
                Ok(())
            }
            Ioctl::ReqBufs(req) => self.request_buffers(req),
            Ioctl::QueryBuf(buf) => self.query_buffer(buf),
            Ioctl::QBuf(buf) => self.queue_buffer(buf),
            Ioctl::DqBuf(buf) => self.dequeue_buffer(buf),
            Ioctl::StreamOn(buf_type) => {
                self.port(buf_type.port()).streaming = true;
                Ok(())
            }
            Ioctl::StreamOff(buf_type) => {
                let port = self.port(buf_type.port());
                port.streaming = false;
                port.queue.clear();
                if buf_type.port() == Port::Output {
                    self.pending_frames.clear();
                }
                Ok(())
            }
            Ioctl::GCtrl(ctrl) => {
                ctrl.value = match ctrl.id {
                    CID_MIN_BUFFERS_FOR_CAPTURE => 4,
                    id => self.controls.get(&id).copied().unwrap_or(0) as i32,
                };
                Ok(())
            }
            Ioctl::SExtCtrls(ctrls) => {
                for ctrl in &ctrls.controls {
                    self.controls.insert(ctrl.id, ctrl.value);
                }
                Ok(())
            }
            Ioctl::SParm(_) => Ok(()),
            Ioctl::DqEvent(event) => {
                *event = self.events.pop_front().ok_or(errno::ENOENT)?;
                event.pending = self.events.len() as u32;
                Ok(())
            }
        }
    }
}

fn default_format(buf_type: BufType) -> Format {
    let mut format = Format::new(buf_type, 640, 480, 0x3231_564e);
    format.planes.push(PlaneFormat {
        size_image: DEFAULT_PLANE_SIZE,
        bytes_per_line: 640,
    });
    format
}

/// The backend handed to the device instance.
pub struct MockCodecBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockCodecBackend {
    pub(crate) fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

// SAFETY: mapped addresses point into heap slots that are only freed by
// REQBUFS, which fails while any slot of the port is mapped. User-pointer
// planes are only touched inside the `ioctl` call carrying them.
unsafe impl DeviceBackend for MockCodecBackend {
    fn open(&mut self, name: &str, _flags: i32) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.open_name = Some(name.to_owned());
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.open_name = None;
        state.mappings.clear();
        state.ports.clear();
        state.pending_frames.clear();
        Ok(())
    }

    fn ioctl(&mut self, cmd: &mut Ioctl) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.ioctl_count += 1;
        state.requests.push(cmd.request());
        if let Some(code) = state.fail_next.take() {
            return Err(code);
        }
        state.handle(cmd)
    }

    fn poll(&mut self, poll_device: bool) -> BackendResult<bool> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.poll_interrupt) {
            return Ok(false);
        }
        let frame_ready = !state.pending_frames.is_empty()
            && state
                .ports
                .get(&Port::Capture)
                .is_some_and(|port| !port.queue.is_empty());
        Ok(!state.events.is_empty() || (poll_device && frame_ready))
    }

    fn set_device_poll_interrupt(&mut self) -> BackendResult<()> {
        self.state.lock().poll_interrupt = true;
        Ok(())
    }

    fn clear_device_poll_interrupt(&mut self) -> BackendResult<()> {
        self.state.lock().poll_interrupt = false;
        Ok(())
    }

    fn mmap(&mut self, length: usize, _prot: i32, _flags: i32, offset: u32) -> BackendResult<usize> {
        self.state.lock().map(length, offset)
    }

    fn munmap(&mut self, addr: usize, _length: usize) -> BackendResult<()> {
        self.state.lock().unmap(addr)
    }

    fn set_parameter(&mut self, key: &str, value: &str) -> BackendResult<()> {
        if key.is_empty() {
            return Err(errno::EINVAL);
        }
        self.state
            .lock()
            .params
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// An end-of-stream event, as a decoder reports after draining.
pub fn eos_event() -> Event {
    Event {
        kind: event_kind::EOS,
        ..Event::default()
    }
}
