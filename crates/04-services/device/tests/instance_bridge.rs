use std::collections::HashSet;
use std::sync::Arc;

use device_abi::{
    BackendResult, BridgeConfig, BufType, Buffer, DeviceBackend, DeviceError, Ioctl, MemoryType,
    NodeId, Plane, PlaneMemory, Port, RequestBuffers,
};
use parking_lot::Mutex;
use services_device::{BackendRegistry, BufferKey, DeviceInstance, SegmentToken};
use transport::SharedSegment;

const SLOT: usize = 256;
const SLOTS: usize = 4;

#[derive(Default)]
struct Record {
    queued: Vec<Vec<u8>>,
    mapped: HashSet<usize>,
    unmapped: usize,
}

/// Fixed heap slots, one per index; the capture port reads back whatever
/// was queued last on the output port.
struct SlotBackend {
    slots: Vec<Box<[u8]>>,
    record: Arc<Mutex<Record>>,
}

impl SlotBackend {
    fn new(record: Arc<Mutex<Record>>) -> Self {
        Self {
            slots: (0..SLOTS).map(|_| vec![0u8; SLOT].into_boxed_slice()).collect(),
            record,
        }
    }
}

// SAFETY: slots live as long as the backend and are never reallocated.
unsafe impl DeviceBackend for SlotBackend {
    fn open(&mut self, _name: &str, _flags: i32) -> BackendResult<()> {
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn ioctl(&mut self, cmd: &mut Ioctl) -> BackendResult<()> {
        match cmd {
            Ioctl::QBuf(buf) if buf.port() == Port::Output => {
                let used = buf.planes[0].bytes_used as usize;
                let slot = self.slots.get(buf.index as usize).ok_or(-22)?;
                self.record.lock().queued.push(slot[..used].to_vec());
                Ok(())
            }
            Ioctl::DqBuf(buf) if buf.port() == Port::Capture => {
                let frame = self.record.lock().queued.last().cloned().ok_or(-11)?;
                let slot = self.slots.get_mut(buf.index as usize).ok_or(-22)?;
                slot[..frame.len()].copy_from_slice(&frame);
                buf.planes[0].bytes_used = frame.len() as u32;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn poll(&mut self, _poll_device: bool) -> BackendResult<bool> {
        Ok(false)
    }

    fn set_device_poll_interrupt(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn clear_device_poll_interrupt(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn mmap(&mut self, length: usize, _prot: i32, _flags: i32, offset: u32) -> BackendResult<usize> {
        let slot = self.slots.get_mut(offset as usize / 4096).ok_or(-22)?;
        if length > slot.len() {
            return Err(-22);
        }
        let addr = slot.as_mut_ptr() as usize;
        self.record.lock().mapped.insert(addr);
        Ok(addr)
    }

    fn munmap(&mut self, addr: usize, _length: usize) -> BackendResult<()> {
        let mut record = self.record.lock();
        if !record.mapped.remove(&addr) {
            return Err(-22);
        }
        record.unmapped += 1;
        Ok(())
    }

    fn set_parameter(&mut self, _key: &str, _value: &str) -> BackendResult<()> {
        Ok(())
    }
}

struct Fixture {
    instance: DeviceInstance,
    record: Arc<Mutex<Record>>,
    dir: tempfile::TempDir,
}

fn fixture(library: &str) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let record = Arc::new(Mutex::new(Record::default()));
    let registry = Arc::new(BackendRegistry::new());
    let shared = Arc::clone(&record);
    registry.register("libslots.so", move || {
        Box::new(SlotBackend::new(Arc::clone(&shared)))
    });
    let config = BridgeConfig {
        shm_dir: dir.path().to_path_buf(),
        backend_library: library.to_owned(),
        ..BridgeConfig::default()
    };
    Fixture {
        instance: DeviceInstance::new(NodeId(1), registry, &config),
        record,
        dir,
    }
}

fn reqbufs(instance: &DeviceInstance, buf_type: BufType, count: u32) {
    instance
        .ioctl_bridged(&mut Ioctl::ReqBufs(RequestBuffers {
            count,
            buf_type,
            memory: MemoryType::Mmap,
            capabilities: 0,
        }))
        .unwrap();
}

/// A client-side segment, named the way the proxy names them.
fn client_segment(f: &Fixture, size: usize) -> (SegmentToken, SharedSegment) {
    let token = SegmentToken::next();
    let segment = SharedSegment::create(f.dir.path(), &token.segment_name(), size).unwrap();
    (token, segment)
}

fn mapped(buf_type: BufType, index: u32, bytes_used: u32) -> Buffer {
    Buffer::new(buf_type, MemoryType::Mmap, index).with_planes([Plane {
        bytes_used,
        ..Plane::new(SLOT as u32, PlaneMemory::MemOffset(index * 4096))
    }])
}

#[test]
fn unknown_library_fails_open() {
    let f = fixture("libmissing.so");
    assert!(matches!(
        f.instance.open_device("decoder", 0),
        Err(DeviceError::Exhausted(_))
    ));
    assert!(!f.instance.is_open());
}

#[test]
fn commands_need_an_open_device() {
    let f = fixture("libslots.so");
    let mut cmd = Ioctl::StreamOn(BufType::VideoOutput);
    assert!(matches!(
        f.instance.ioctl_bridged(&mut cmd),
        Err(DeviceError::Protocol(_))
    ));
    assert!(f.instance.check_id(NodeId(1)).is_ok());
    assert!(f.instance.check_id(NodeId(2)).is_err());
}

#[test]
fn output_segment_is_copied_into_the_mapping_on_queue() {
    let f = fixture("libslots.so");
    f.instance.open_device("decoder", 0).unwrap();
    reqbufs(&f.instance, BufType::VideoOutput, 2);

    let (token, mut segment) = client_segment(&f, SLOT);
    segment.as_mut_slice()[..5].copy_from_slice(b"hello");
    let key = BufferKey::new(Port::Output, 1, 0);
    let magic = f
        .instance
        .map_segment(key, token, SLOT, 0x3, 0x1, 4096)
        .unwrap();
    assert!(f.record.lock().mapped.contains(&magic));

    f.instance
        .ioctl_bridged(&mut Ioctl::QBuf(mapped(BufType::VideoOutput, 1, 5)))
        .unwrap();
    assert_eq!(f.record.lock().queued, vec![b"hello".to_vec()]);
}

#[test]
fn capture_mapping_is_copied_into_the_segment_on_dequeue() {
    let f = fixture("libslots.so");
    f.instance.open_device("decoder", 0).unwrap();
    reqbufs(&f.instance, BufType::VideoCapture, 4);
    f.record.lock().queued.push(b"decoded".to_vec());

    let (token, segment) = client_segment(&f, SLOT);
    f.instance
        .map_segment(BufferKey::new(Port::Capture, 2, 0), token, SLOT, 0x3, 0x1, 2 * 4096)
        .unwrap();

    let mut dq = Ioctl::DqBuf(mapped(BufType::VideoCapture, 2, 0));
    f.instance.ioctl_bridged(&mut dq).unwrap();
    assert_eq!(&segment.as_slice()[..7], b"decoded");
}

#[test]
fn undersized_segment_is_refused() {
    let f = fixture("libslots.so");
    f.instance.open_device("decoder", 0).unwrap();
    reqbufs(&f.instance, BufType::VideoOutput, 1);
    let (token, _segment) = client_segment(&f, 16);
    let result = f.instance.map_segment(
        BufferKey::new(Port::Output, 0, 0),
        token,
        SLOT,
        0x3,
        0x1,
        0,
    );
    assert!(matches!(result, Err(DeviceError::Protocol(_))));
    assert!(f.record.lock().mapped.is_empty());
}

#[test]
fn unknown_segment_token_is_refused() {
    let f = fixture("libslots.so");
    f.instance.open_device("decoder", 0).unwrap();
    reqbufs(&f.instance, BufType::VideoCapture, 1);
    let result = f.instance.map_segment(
        BufferKey::new(Port::Capture, 0, 0),
        SegmentToken::next(),
        SLOT,
        0x3,
        0x1,
        0,
    );
    assert!(matches!(result, Err(DeviceError::Protocol(_))));
    assert!(f.record.lock().mapped.is_empty());
}

#[test]
fn releasing_buffers_unmaps_them() {
    let f = fixture("libslots.so");
    f.instance.open_device("decoder", 0).unwrap();
    reqbufs(&f.instance, BufType::VideoOutput, 2);
    let segments: Vec<_> = (0..2)
        .map(|i| {
            let (token, segment) = client_segment(&f, SLOT);
            f.instance
                .map_segment(
                    BufferKey::new(Port::Output, i, 0),
                    token,
                    SLOT,
                    0x3,
                    0x1,
                    i * 4096,
                )
                .unwrap();
            segment
        })
        .collect();

    reqbufs(&f.instance, BufType::VideoOutput, 0);
    assert_eq!(f.instance.buffer_count(), 0);
    assert_eq!(f.record.lock().unmapped, 2);

    reqbufs(&f.instance, BufType::VideoCapture, 3);
    assert_eq!(f.instance.release_all(), 3);
    assert_eq!(f.instance.release_all(), 0);

    f.instance.shutdown();
    f.instance.shutdown();
    assert!(!f.instance.is_open());
    drop(segments);
}
