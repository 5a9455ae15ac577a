//! Server-side device instance: drives the real backend and bridges buffer
//! memory through the server buffer map.

use std::path::PathBuf;
use std::sync::Arc;

use device_abi::{
    BridgeConfig, Buffer, DeviceBackend, DeviceError, DeviceResult, Ioctl, MemoryType, NodeId,
    PlaneMemory, Port, VideoDevice,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use transport::SharedSegment;

use crate::backend::BackendRegistry;
use crate::segments::{attach_segment, copy_len, BufferKey, SegmentToken};
use crate::server_map::{Mapping, ServerBufferMap, ServerEntry};

/// Maps a vendor status onto the taxonomy. A failure reported as `0`
/// cannot travel as a status, so it becomes a generic failure.
pub(crate) fn backend_error(code: i32) -> DeviceError {
    if code == 0 {
        DeviceError::bus("backend failed without a status")
    } else {
        DeviceError::Backend(code)
    }
}

struct InstanceState {
    backend: Option<Box<dyn DeviceBackend>>,
    open: bool,
    buffers: ServerBufferMap,
}

impl InstanceState {
    fn backend(&mut self) -> DeviceResult<&mut Box<dyn DeviceBackend>> {
        if !self.open {
            return Err(DeviceError::protocol("device is not open"));
        }
        self.backend
            .as_mut()
            .ok_or_else(|| DeviceError::protocol("device has no backend"))
    }
}

pub struct DeviceInstance {
    id: NodeId,
    library: String,
    shm_dir: PathBuf,
    backends: Arc<BackendRegistry>,
    state: Mutex<InstanceState>,
}

impl DeviceInstance {
    pub fn new(id: NodeId, backends: Arc<BackendRegistry>, config: &BridgeConfig) -> Self {
        Self {
            id,
            library: config.backend_library.clone(),
            shm_dir: config.shm_dir.clone(),
            backends,
            state: Mutex::new(InstanceState {
                backend: None,
                open: false,
                buffers: ServerBufferMap::new(),
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Rejects calls carrying another node's id.
    pub fn check_id(&self, caller: NodeId) -> DeviceResult<()> {
        if caller == self.id {
            Ok(())
        } else {
            Err(DeviceError::protocol(format!(
                "call for {caller} reached {}",
                self.id
            )))
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn buffer_keys(&self) -> Vec<BufferKey> {
        self.state.lock().buffers.keys()
    }

    /// Resolves the backend on first use, then opens the device.
    pub fn open_device(&self, name: &str, flags: i32) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.backend.is_none() {
            state.backend = Some(self.backends.resolve(&self.library)?);
        }
        if let Some(backend) = state.backend.as_deref_mut() {
            backend.open(name, flags).map_err(backend_error)?;
        }
        state.open = true;
        info!("{}: opened {name}", self.id);
        Ok(())
    }

    /// Releases every buffer and closes the backend.
    pub fn close_device(&self) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let released = Self::release_entries(&mut state);
        let backend = state.backend()?;
        let result = backend.close().map_err(backend_error);
        state.open = false;
        info!("{}: closed, {released} buffer(s) released", self.id);
        result
    }

    /// Executes `cmd` with buffer memory bridged through shared segments.
    pub fn ioctl_bridged(&self, cmd: &mut Ioctl) -> DeviceResult<()> {
        self.run_ioctl(cmd, true)
    }

    /// Maps the backend buffer at `offset` and pairs it with the client's segment.
    /// Returns the real address, which the client keeps as its magic.
    pub fn map_segment(
        &self,
        key: BufferKey,
        token: SegmentToken,
        length: usize,
        prot: i32,
        flags: i32,
        offset: u32,
    ) -> DeviceResult<usize> {
        let segment_name = token.segment_name();
        let segment = attach_segment(&self.shm_dir, &segment_name)?;
        if segment.len() < length {
            return Err(DeviceError::protocol(format!(
                "segment {segment_name} holds {} bytes, {length} needed",
                segment.len()
            )));
        }
        let mut state = self.state.lock();
        let addr = state
            .backend()?
            .mmap(length, prot, flags, offset)
            .map_err(backend_error)?;
        let stale = state.buffers.entry(key).mapping.take();
        if let Some(stale) = stale {
            warn!("{}: {key} mapped twice", self.id);
            Self::unmap(&mut state, stale);
        }
        let entry = state.buffers.entry(key);
        entry.segment = Some(segment);
        entry.token = None;
        entry.mapping = Some(Mapping { addr, len: length });
        debug!("{}: {key} mapped at {addr:#x} via {segment_name}", self.id);
        Ok(addr)
    }

    /// Unmaps the backend buffer at `magic` and drops its entry.
    pub fn unmap_segment(&self, magic: usize) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let key = state.buffers.find_by_mapping(magic).ok_or_else(|| {
            DeviceError::protocol(format!("no buffer mapped at {magic:#x}"))
        })?;
        let entry = state.buffers.remove(&key);
        let mapping = entry.and_then(|entry| entry.mapping);
        match mapping {
            Some(mapping) => state
                .backend()?
                .munmap(mapping.addr, mapping.len)
                .map_err(backend_error),
            None => Ok(()),
        }
    }

    /// Drops every buffer-map entry, unmapping backend buffers. Returns the
    /// number of entries released.
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        Self::release_entries(&mut state)
    }

    /// Releases buffers and closes the backend if it is still open.
    pub fn shutdown(&self) {
        let open = self.state.lock().open;
        if open {
            if let Err(err) = self.close_device() {
                warn!("{}: close during shutdown failed: {err}", self.id);
            }
        } else {
            self.release_all();
        }
    }

    fn release_entries(state: &mut InstanceState) -> usize {
        let entries = state.buffers.drain();
        let count = entries.len();
        for (_, entry) in entries {
            if let Some(mapping) = entry.mapping {
                Self::unmap(state, mapping);
            }
        }
        count
    }

    fn unmap(state: &mut InstanceState, mapping: Mapping) {
        if let Some(backend) = state.backend.as_deref_mut() {
            if let Err(code) = backend.munmap(mapping.addr, mapping.len) {
                warn!("backend munmap of {:#x} failed: {code}", mapping.addr);
            }
        }
    }

    fn run_ioctl(&self, cmd: &mut Ioctl, bridged: bool) -> DeviceResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.backend()?;
        if bridged {
            self.stage_in(&mut state.buffers, cmd)?;
        }
        let result = state.backend()?.ioctl(cmd).map_err(backend_error);
        if let Err(err) = result {
            debug!("{}: backend ioctl failed: {err}", self.id);
            return Err(err);
        }
        if bridged {
            Self::stage_out(&mut state.buffers, cmd);
        }
        self.track(state, cmd);
        Ok(())
    }

    /// Bookkeeping that follows a successful command.
    fn track(&self, state: &mut InstanceState, cmd: &Ioctl) {
        match cmd {
            Ioctl::SFmt(format) | Ioctl::GFmt(format) => {
                state
                    .buffers
                    .set_plane_count(format.buf_type.port(), format.plane_count());
            }
            Ioctl::ReqBufs(req) => {
                let port = req.buf_type.port();
                let released = if req.count == 0 {
                    state.buffers.take_port(port)
                } else {
                    state.buffers.reserve(port, req.count)
                };
                if !released.is_empty() {
                    debug!("{}: {} entries released on {port:?}", self.id, released.len());
                }
                for mapping in released.into_iter().filter_map(|entry| entry.mapping) {
                    Self::unmap(state, mapping);
                }
            }
            _ => {}
        }
    }

    /// Prepares a queued buffer: output bytes move from the segment into
    /// the real mapping, and user-pointer planes are pointed at segments.
    ///
    /// The output copy runs here on the server. The client writes into its
    /// segment and never copies, but the backend only sees the bytes after
    /// this one copy, because its mapping is not the client's segment.
    fn stage_in(&self, buffers: &mut ServerBufferMap, cmd: &mut Ioctl) -> DeviceResult<()> {
        let Ioctl::QBuf(buf) = cmd else {
            return Ok(());
        };
        match buf.memory {
            MemoryType::Mmap if buf.port() == Port::Output => {
                for (plane_index, plane) in buf.planes.iter().enumerate() {
                    let key = BufferKey::new(Port::Output, buf.index, plane_index as u32);
                    let Some(ServerEntry {
                        segment: Some(segment),
                        mapping: Some(mapping),
                        ..
                    }) = buffers.get(&key)
                    else {
                        warn!("{}: queued {key} has no mapping", self.id);
                        continue;
                    };
                    let n = copy_len(plane.bytes_used, plane.length, segment.len().min(mapping.len));
                    copy_segment_to_mapping(segment, *mapping, n);
                }
                Ok(())
            }
            MemoryType::UserPtr => self.attach_user_planes(buffers, buf),
            _ => Ok(()),
        }
    }

    fn attach_user_planes(&self, buffers: &mut ServerBufferMap, buf: &mut Buffer) -> DeviceResult<()> {
        let port = buf.port();
        let index = buf.index;
        for (plane_index, plane) in buf.planes.iter_mut().enumerate() {
            let token = plane.m.user_ptr().map(SegmentToken).ok_or_else(|| {
                DeviceError::protocol("user-pointer buffer without a pointer plane")
            })?;
            let entry = buffers.entry(BufferKey::new(port, index, plane_index as u32));
            if entry.token != Some(token) {
                entry.segment = Some(attach_segment(&self.shm_dir, &token.segment_name())?);
                entry.token = Some(token);
            }
            let base = match entry.segment.as_ref() {
                Some(segment) if segment.len() >= plane.length as usize => segment.base_addr(),
                _ => {
                    return Err(DeviceError::protocol(format!(
                        "segment for {index}/{plane_index} smaller than {} bytes",
                        plane.length
                    )))
                }
            };
            plane.m = PlaneMemory::UserPtr(base as u64);
        }
        Ok(())
    }

    /// Reverses [`Self::stage_in`] on the result: captured bytes move from
    /// the real mapping into the segment and user-pointer planes carry the
    /// client's tokens again.
    fn stage_out(buffers: &mut ServerBufferMap, cmd: &mut Ioctl) {
        let (dequeued, buf) = match cmd {
            Ioctl::DqBuf(buf) => (true, buf),
            Ioctl::QBuf(buf) => (false, buf),
            _ => return,
        };
        match buf.memory {
            MemoryType::Mmap if dequeued && buf.port() == Port::Capture => {
                for (plane_index, plane) in buf.planes.iter().enumerate() {
                    let key = BufferKey::new(Port::Capture, buf.index, plane_index as u32);
                    if let Some(ServerEntry {
                        segment: Some(segment),
                        mapping: Some(mapping),
                        ..
                    }) = buffers.get_mut(&key)
                    {
                        let n = copy_len(plane.bytes_used, plane.length, segment.len().min(mapping.len));
                        copy_mapping_to_segment(*mapping, segment, n);
                    }
                }
            }
            MemoryType::UserPtr => {
                for plane in buf.planes.iter_mut() {
                    let Some(addr) = plane.m.user_ptr() else {
                        continue;
                    };
                    let token = buffers
                        .find_by_segment(addr as usize)
                        .and_then(|key| buffers.get(&key))
                        .and_then(|entry| entry.token);
                    match token {
                        Some(token) => plane.m = PlaneMemory::UserPtr(token.0),
                        None => error!("backend returned unknown user pointer {addr:#x}"),
                    }
                }
            }
            _ => {}
        }
    }
}

fn copy_segment_to_mapping(segment: &SharedSegment, mapping: Mapping, n: usize) {
    let n = n.min(segment.len()).min(mapping.len);
    // SAFETY: backend mappings stay valid for `mapping.len` bytes until
    // munmap, which only this instance issues, under the same lock.
    unsafe {
        std::ptr::copy_nonoverlapping(segment.as_slice().as_ptr(), mapping.addr as *mut u8, n);
    }
}

fn copy_mapping_to_segment(mapping: Mapping, segment: &mut SharedSegment, n: usize) {
    let n = n.min(segment.len()).min(mapping.len);
    // SAFETY: as above.
    unsafe {
        std::ptr::copy_nonoverlapping(
            mapping.addr as *const u8,
            segment.as_mut_slice().as_mut_ptr(),
            n,
        );
    }
}

/// In-process access: the same operations without the shared-memory bridge.
/// Mappings made here are returned directly and are the caller's to unmap.
impl VideoDevice for DeviceInstance {
    fn open(&self, name: &str, flags: i32) -> bool {
        self.open_device(name, flags)
            .map_err(|err| warn!("{}: open {name} failed: {err}", self.id))
            .is_ok()
    }

    fn close(&self) -> bool {
        self.close_device()
            .map_err(|err| warn!("{}: close failed: {err}", self.id))
            .is_ok()
    }

    fn ioctl(&self, cmd: &mut Ioctl) -> DeviceResult<()> {
        self.run_ioctl(cmd, false)
    }

    fn poll(&self, poll_device: bool) -> DeviceResult<bool> {
        self.state
            .lock()
            .backend()?
            .poll(poll_device)
            .map_err(backend_error)
    }

    fn set_device_poll_interrupt(&self) -> DeviceResult<()> {
        self.state
            .lock()
            .backend()?
            .set_device_poll_interrupt()
            .map_err(backend_error)
    }

    fn clear_device_poll_interrupt(&self) -> DeviceResult<()> {
        self.state
            .lock()
            .backend()?
            .clear_device_poll_interrupt()
            .map_err(backend_error)
    }

    fn mmap(
        &self,
        _addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        offset: u32,
    ) -> DeviceResult<usize> {
        self.state
            .lock()
            .backend()?
            .mmap(length, prot, flags, offset)
            .map_err(backend_error)
    }

    fn munmap(&self, addr: usize, length: usize) -> DeviceResult<()> {
        self.state
            .lock()
            .backend()?
            .munmap(addr, length)
            .map_err(backend_error)
    }

    fn set_parameter(&self, key: &str, value: &str) -> DeviceResult<()> {
        self.state
            .lock()
            .backend()?
            .set_parameter(key, value)
            .map_err(backend_error)
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
