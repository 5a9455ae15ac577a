//! Client-side device proxy.
//!
//! Every call carries the node id first. Mapped buffers are backed by a
//! shared segment created here at `mmap`; user-pointer buffers are staged
//! through a segment per slot, and the pointer value on the wire is the
//! segment's token rather than an address in this process.

use std::path::PathBuf;

use device_abi::{
    device_methods, Buffer, DeviceError, DeviceResult, Ioctl, IoctlPayload, MemoryType, NodeId,
    PlaneMemory, Port, VideoDevice,
};
use log::{debug, warn};
use node_runtime::NodeObject;
use parking_lot::Mutex;
use transport::Message;
use transport_codecs::{append_ioctl, read_ioctl_result, CallCodec, DeviceFields};

use crate::client_map::{ClientBufferMap, ClientEntry};
use crate::segments::{copy_len, create_segment, BufferKey, SegmentToken};

pub struct DeviceProxy {
    id: NodeId,
    codec: CallCodec,
    shm_dir: PathBuf,
    buffers: Mutex<ClientBufferMap>,
}

impl DeviceProxy {
    pub fn new(id: NodeId, codec: CallCodec, shm_dir: PathBuf) -> Self {
        Self {
            id,
            codec,
            shm_dir,
            buffers: Mutex::new(ClientBufferMap::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of slots currently backed by a shared segment.
    pub fn mapped_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// The server's real address for the slot mapped at `addr`.
    pub fn magic(&self, addr: usize) -> Option<i64> {
        let buffers = self.buffers.lock();
        buffers
            .find_by_addr(addr)
            .and_then(|key| buffers.get(&key))
            .and_then(|entry| entry.magic)
    }

    /// Runs a command given in its encoded form. Unknown request codes are
    /// rejected here and never sent.
    pub fn ioctl_payload(&self, payload: &mut IoctlPayload) -> DeviceResult<()> {
        let mut cmd = Ioctl::from_payload(payload)?;
        self.ioctl(&mut cmd)?;
        *payload = cmd.to_payload();
        Ok(())
    }

    fn call(&self, method: &str) -> DeviceResult<Message> {
        let mut call = self
            .codec
            .obtain(method)
            .ok_or_else(|| DeviceError::bus(format!("{} proxy is closed", self.id)))?;
        call.append_i32(self.id.to_wire());
        Ok(call)
    }

    /// Points each user-pointer plane at a segment, copying output bytes in.
    fn stage_user_buffer(&self, buffers: &mut ClientBufferMap, buf: &mut Buffer) -> DeviceResult<()> {
        let port = buf.port();
        let index = buf.index;
        for (plane_index, plane) in buf.planes.iter_mut().enumerate() {
            let user = plane.m.user_ptr().ok_or_else(|| {
                DeviceError::protocol("user-pointer buffer without a pointer plane")
            })?;
            let key = BufferKey::new(port, index, plane_index as u32);
            let length = plane.length as usize;
            let fits = buffers
                .get(&key)
                .is_some_and(|entry| entry.segment.len() >= length);
            if !fits {
                let (token, segment) = create_segment(&self.shm_dir, length)?;
                buffers.insert(
                    key,
                    ClientEntry {
                        segment,
                        token,
                        magic: None,
                        user_addr: None,
                    },
                );
            }
            let entry = buffers
                .get_mut(&key)
                .ok_or_else(|| DeviceError::protocol(format!("no segment for {key}")))?;
            entry.user_addr = Some(user);
            if port == Port::Output {
                let n = copy_len(plane.bytes_used, plane.length, entry.segment.len());
                // SAFETY: a queued user-pointer plane must be readable for
                // `length` bytes, as with the kernel interface.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        user as *const u8,
                        entry.segment.as_mut_slice().as_mut_ptr(),
                        n,
                    );
                }
            }
            plane.m = PlaneMemory::UserPtr(entry.token.0);
        }
        Ok(())
    }

    /// Puts the caller's pointers back, copying captured bytes out on dequeue.
    fn restore_user_buffer(buffers: &ClientBufferMap, buf: &mut Buffer, dequeued: bool) {
        let port = buf.port();
        for plane in buf.planes.iter_mut() {
            let Some(token) = plane.m.user_ptr().map(SegmentToken) else {
                continue;
            };
            let entry = buffers.find_by_token(token).and_then(|key| buffers.get(&key));
            let Some((entry, user)) = entry.and_then(|e| e.user_addr.map(|user| (e, user))) else {
                warn!("reply names unknown segment {}", token.segment_name());
                continue;
            };
            if dequeued && port == Port::Capture {
                let n = copy_len(plane.bytes_used, plane.length, entry.segment.len());
                // SAFETY: a dequeued capture plane is the caller's buffer,
                // writable for `length` bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(entry.segment.as_slice().as_ptr(), user as *mut u8, n);
                }
            }
            plane.m = PlaneMemory::UserPtr(user);
        }
    }

    /// Client-side bookkeeping after a successful command.
    fn track(&self, buffers: &mut ClientBufferMap, result: &Ioctl) {
        match result {
            Ioctl::QueryBuf(buf) if buf.memory == MemoryType::Mmap => {
                for (plane_index, plane) in buf.planes.iter().enumerate() {
                    if let Some(offset) = plane.m.mem_offset() {
                        buffers.record_offset(
                            offset,
                            BufferKey::new(buf.port(), buf.index, plane_index as u32),
                        );
                    }
                }
            }
            Ioctl::ReqBufs(req) if req.count == 0 => {
                let released = buffers.release_port(req.buf_type.port());
                debug!("{}: released {released} segment(s)", self.id);
            }
            _ => {}
        }
    }
}

impl VideoDevice for DeviceProxy {
    fn open(&self, name: &str, flags: i32) -> bool {
        let result = self.call(device_methods::OPEN).and_then(|mut call| {
            call.append_str(name).append_i32(flags);
            self.codec.call_status(call)
        });
        if let Err(err) = &result {
            warn!("{}: open {name} failed: {err}", self.id);
        }
        result.is_ok()
    }

    fn close(&self) -> bool {
        let result = self
            .call(device_methods::CLOSE)
            .and_then(|call| self.codec.call_status(call));
        match result {
            Ok(()) => {
                self.buffers.lock().clear();
                true
            }
            Err(err) => {
                warn!("{}: close failed: {err}", self.id);
                false
            }
        }
    }

    fn ioctl(&self, cmd: &mut Ioctl) -> DeviceResult<()> {
        let mut buffers = self.buffers.lock();
        let mut wire = cmd.clone();
        if let Ioctl::QBuf(buf) = &mut wire {
            if buf.memory == MemoryType::UserPtr {
                self.stage_user_buffer(&mut buffers, buf)?;
            }
        }

        let mut call = self.call(device_methods::IOCTL)?;
        append_ioctl(&mut call, &wire);
        let mut reply = self.codec.call_with_results(call)?;
        let mut result = read_ioctl_result(&mut reply, wire.request())?;

        let dequeued = matches!(result, Ioctl::DqBuf(_));
        if let Some(buf) = result.buffer_mut() {
            if buf.memory == MemoryType::UserPtr {
                Self::restore_user_buffer(&buffers, buf, dequeued);
            }
        }
        self.track(&mut buffers, &result);
        cmd.update_from(result)
    }

    fn poll(&self, poll_device: bool) -> DeviceResult<bool> {
        let mut call = self.call(device_methods::POLL)?;
        call.append_bool(poll_device);
        self.codec.call_with_results(call)?.take_bool()
    }

    fn set_device_poll_interrupt(&self) -> DeviceResult<()> {
        let call = self.call(device_methods::SET_POLL_INTERRUPT)?;
        self.codec.call_status(call)
    }

    fn clear_device_poll_interrupt(&self) -> DeviceResult<()> {
        let call = self.call(device_methods::CLEAR_POLL_INTERRUPT)?;
        self.codec.call_status(call)
    }

    /// Maps the buffer whose `QUERYBUF` offset is `offset`. The returned
    /// address is the base of a shared segment in this process.
    fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        offset: u32,
    ) -> DeviceResult<usize> {
        let mut buffers = self.buffers.lock();
        let key = buffers.key_for_offset(offset).ok_or_else(|| {
            DeviceError::protocol(format!("offset {offset:#x} was not returned by QUERYBUF"))
        })?;
        let (token, segment) = create_segment(&self.shm_dir, length)?;

        let mut call = self.call(device_methods::MMAP)?;
        call.append_i64(addr as i64)
            .append_i64(length as i64)
            .append_i32(prot)
            .append_i32(flags)
            .append_i32(offset as i32)
            .append_i32(key.port.raw())
            .append_i32(key.index as i32)
            .append_i32(key.plane as i32)
            .append_i64(token.0 as i64)
            .append_i32(segment.len() as i32);
        let magic = self.codec.call_with_results(call)?.take_i64()?;

        let base = segment.base_addr();
        buffers.insert(
            key,
            ClientEntry {
                segment,
                token,
                magic: Some(magic),
                user_addr: None,
            },
        );
        debug!("{}: {key} mapped at {base:#x} (server {magic:#x})", self.id);
        Ok(base)
    }

    /// Unmaps a buffer returned by [`VideoDevice::mmap`] and erases its entry.
    fn munmap(&self, addr: usize, length: usize) -> DeviceResult<()> {
        let mut buffers = self.buffers.lock();
        let key = buffers
            .find_by_addr(addr)
            .ok_or_else(|| DeviceError::protocol(format!("nothing mapped at {addr:#x}")))?;
        let magic = buffers
            .get(&key)
            .and_then(|entry| entry.magic)
            .ok_or_else(|| DeviceError::protocol(format!("{key} is not a mapped buffer")))?;

        let mut call = self.call(device_methods::MUNMAP)?;
        call.append_i64(magic).append_i64(length as i64);
        self.codec.call_status(call)?;
        buffers.remove(&key);
        Ok(())
    }

    fn set_parameter(&self, key: &str, value: &str) -> DeviceResult<()> {
        let mut call = self.call(device_methods::SET_PARAMETER)?;
        call.append_str(key).append_str(value);
        self.codec.call_status(call)
    }
}

impl NodeObject for DeviceProxy {
    fn teardown(&self) {
        self.codec.close();
        self.buffers.lock().clear();
    }
}
