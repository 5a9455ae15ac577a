#![cfg(all(test, not(target_arch = "wasm32")))]

//! A bus, a device server backed by the mock decoder, and helpers for
//! driving clients against it.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use device_abi::{
    BridgeConfig, BufType, Buffer, DeviceResult, Ioctl, MemoryType, NodeId, Plane, PlaneMemory,
    RequestBuffers, VideoDevice,
};
use mock::{MockBackends, MockHandle};
use services_device::{BackendRegistry, DeviceInstance, DeviceServer, VideoDeviceClient};
use services_directory::{DirectoryClient, NodeIdAllocator};
use tempfile::TempDir;
use transport::{LocalBus, LocalConnection};

pub const LIBRARY: &str = "libvdev-mock.so";

pub struct Bridge {
    pub bus: LocalBus,
    pub server: DeviceServer,
    pub mocks: MockBackends,
    pub config: BridgeConfig,
    shm: TempDir,
}

impl Bridge {
    pub fn start() -> Self {
        Self::start_with_limit(64)
    }

    pub fn start_with_limit(limit: u32) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let shm = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            call_timeout_ms: 2_000,
            shm_dir: shm.path().to_path_buf(),
            backend_library: LIBRARY.to_owned(),
            max_node_id: limit,
        };
        let bus = LocalBus::new().unwrap();
        let backends = Arc::new(BackendRegistry::new());
        let mocks = mock::install(&backends, LIBRARY);
        let server = DeviceServer::start_with_allocator(
            bus.connect(),
            backends,
            config.clone(),
            NodeIdAllocator::shared(limit),
        )
        .unwrap();
        Self {
            bus,
            server,
            mocks,
            config,
            shm,
        }
    }

    pub fn shm_dir(&self) -> &Path {
        self.shm.path()
    }

    /// A fresh connection with its own directory client, like a separate process.
    pub fn client(&self) -> (Arc<LocalConnection>, VideoDeviceClient) {
        let conn = self.bus.connect();
        let client = self.client_on(&conn).unwrap();
        (conn, client)
    }

    pub fn client_on(&self, conn: &Arc<LocalConnection>) -> DeviceResult<VideoDeviceClient> {
        let directory = Arc::new(DirectoryClient::connect(conn.clone(), &self.config)?);
        VideoDeviceClient::connect_via(directory, conn.clone(), &self.config)
    }

    pub fn instance(&self, id: NodeId) -> Arc<DeviceInstance> {
        self.server.instance(id).unwrap()
    }

    /// The mock opened most recently.
    pub fn mock(&self) -> MockHandle {
        self.mocks.latest().unwrap()
    }

    pub fn segment_files(&self) -> usize {
        std::fs::read_dir(self.shm_dir()).unwrap().count()
    }
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn request_buffers(
    dev: &impl VideoDevice,
    buf_type: BufType,
    memory: MemoryType,
    count: u32,
) -> u32 {
    let mut cmd = Ioctl::ReqBufs(RequestBuffers {
        count,
        buf_type,
        memory,
        capabilities: 0,
    });
    dev.ioctl(&mut cmd).unwrap();
    match cmd {
        Ioctl::ReqBufs(req) => req.count,
        other => panic!("unexpected result {other:?}"),
    }
}

/// Queries slot `index` and maps its first plane. Returns `(addr, plane)`.
pub fn map_buffer(dev: &impl VideoDevice, buf_type: BufType, index: u32) -> (usize, Plane) {
    let mut query = Ioctl::QueryBuf(placeholder(buf_type, MemoryType::Mmap, index));
    dev.ioctl(&mut query).unwrap();
    let plane = query.buffer().unwrap().planes[0];
    let offset = plane.m.mem_offset().unwrap();
    let addr = dev
        .mmap(0, plane.length as usize, 0x3, 0x1, offset)
        .unwrap();
    (addr, plane)
}

/// A descriptor the device fills in; the wire needs at least one plane.
pub fn placeholder(buf_type: BufType, memory: MemoryType, index: u32) -> Buffer {
    let m = match memory {
        MemoryType::Mmap => PlaneMemory::MemOffset(0),
        MemoryType::UserPtr => PlaneMemory::UserPtr(0),
        MemoryType::DmaBuf => PlaneMemory::Fd(-1),
    };
    Buffer::new(buf_type, memory, index).with_planes([Plane::new(0, m)])
}

pub fn dequeue(dev: &impl VideoDevice, buf_type: BufType, memory: MemoryType) -> DeviceResult<Buffer> {
    let mut cmd = Ioctl::DqBuf(placeholder(buf_type, memory, 0));
    dev.ioctl(&mut cmd)?;
    match cmd {
        Ioctl::DqBuf(buf) => Ok(buf),
        other => panic!("unexpected result {other:?}"),
    }
}

pub fn mapped_buffer(buf_type: BufType, index: u32, plane: Plane, bytes_used: u32) -> Buffer {
    let mut buf = Buffer::new(buf_type, MemoryType::Mmap, index).with_planes([Plane {
        bytes_used,
        ..plane
    }]);
    buf.bytes_used = bytes_used;
    buf
}

pub fn user_buffer(buf_type: BufType, index: u32, data: &mut [u8], bytes_used: u32) -> Buffer {
    let plane = Plane {
        bytes_used,
        ..Plane::new(
            data.len() as u32,
            PlaneMemory::UserPtr(data.as_mut_ptr() as u64),
        )
    };
    let mut buf = Buffer::new(buf_type, MemoryType::UserPtr, index).with_planes([plane]);
    buf.bytes_used = bytes_used;
    buf
}

/// # Safety
/// `addr` must be a live mapping of at least `len` bytes.
pub unsafe fn mapped_bytes<'a>(addr: usize, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(addr as *mut u8, len)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
