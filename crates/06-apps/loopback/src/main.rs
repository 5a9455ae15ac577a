//! Streams frames through the device bridge on an in-process bus and checks
//! that each one comes back from the mock decoder unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use device_abi::{
    map_flags, prot, BridgeConfig, BufType, Buffer, Format, Ioctl, MemoryType, Plane, PlaneFormat,
    PlaneMemory, RequestBuffers, VideoDevice,
};
use services_device::{BackendRegistry, DeviceServer, VideoDeviceClient};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use transport::LocalBus;

/// Run a directory, a device server and one client on a local bus.
#[derive(Parser, Debug)]
#[command(author, version, about = "Loop frames through the device bridge", long_about = None)]
struct Cli {
    /// Number of frames to stream.
    #[arg(long, default_value_t = 64)]
    frames: u32,

    /// How frame memory is shared with the device.
    #[arg(long, value_enum, default_value_t = MemoryArg::Mmap)]
    memory: MemoryArg,

    /// Bytes per frame (decimal or hex).
    #[arg(long, value_parser = parse_u32, default_value_t = 4096)]
    frame_size: u32,

    /// Buffer slots requested per port.
    #[arg(long, default_value_t = 4)]
    buffers: u32,

    /// JSON configuration file; environment variables override it.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MemoryArg {
    /// Device-allocated buffers mapped into the client.
    Mmap,
    /// Client-allocated buffers passed by pointer.
    Userptr,
}

impl From<MemoryArg> for MemoryType {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Mmap => MemoryType::Mmap,
            MemoryArg::Userptr => MemoryType::UserPtr,
        }
    }
}

#[derive(Debug, Default)]
struct Report {
    frames: u32,
    bytes: u64,
    mismatches: u32,
    elapsed: Duration,
}

/// Client memory behind one buffer slot.
enum SlotMemory {
    Mapped { addr: usize, len: usize },
    User(Vec<u8>),
}

struct Slot {
    index: u32,
    plane: Plane,
    memory: SlotMemory,
}

impl Slot {
    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.memory {
            // SAFETY: the address came from `mmap` and stays mapped until
            // `release` unmaps it; slots are used from one thread only.
            SlotMemory::Mapped { addr, len } => unsafe {
                std::slice::from_raw_parts_mut(*addr as *mut u8, *len)
            },
            SlotMemory::User(bytes) => bytes,
        }
    }

    fn descriptor(&mut self, buf_type: BufType, bytes_used: u32) -> Buffer {
        let (memory, m) = match &mut self.memory {
            SlotMemory::Mapped { .. } => (MemoryType::Mmap, self.plane.m),
            SlotMemory::User(bytes) => (
                MemoryType::UserPtr,
                PlaneMemory::UserPtr(bytes.as_mut_ptr() as u64),
            ),
        };
        let mut buf = Buffer::new(buf_type, memory, self.index).with_planes([Plane {
            bytes_used,
            m,
            ..self.plane
        }]);
        buf.bytes_used = bytes_used;
        buf
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    ensure!(cli.buffers > 0, "--buffers must be at least 1");
    ensure!(cli.frame_size > 0, "--frame-size must be at least 1");
    let config = load_config(cli.config.as_deref())?;

    let bus = LocalBus::new().context("failed to start the local bus")?;
    let backends = Arc::new(BackendRegistry::new());
    let mocks = mock::install(&backends, &config.backend_library);
    let server = DeviceServer::start(bus.connect(), backends, config.clone())
        .context("failed to start the device server")?;
    let client = VideoDeviceClient::connect(bus.connect(), &config)
        .context("failed to connect a client")?;
    info!(node = %client.id(), memory = ?cli.memory, "client connected");

    ensure!(client.open("vdev-loopback", 0), "device refused to open");
    let report = stream(&client, &cli)?;
    if !client.close() {
        warn!("close failed");
    }

    let backend_frames = mocks
        .latest()
        .map(|handle| handle.observed_frames().len())
        .unwrap_or_default();
    drop(client);
    server.stop();

    let secs = report.elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} frame(s), {} byte(s) in {:.3}s ({:.1} frames/s); backend saw {}; {} mismatch(es)",
        report.frames,
        report.bytes,
        secs,
        f64::from(report.frames) / secs,
        backend_frames,
        report.mismatches
    );
    if report.mismatches > 0 {
        bail!("{} frame(s) came back corrupted", report.mismatches);
    }
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let base = match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config {path:?}"))?,
        None => BridgeConfig::default(),
    };
    base.with_env().context("invalid environment override")
}

fn stream(dev: &VideoDeviceClient, cli: &Cli) -> Result<Report> {
    let memory = MemoryType::from(cli.memory);
    let mut outputs = setup_port(dev, BufType::VideoOutput, memory, cli)?;
    let mut captures = setup_port(dev, BufType::VideoCapture, memory, cli)?;
    dev.ioctl(&mut Ioctl::StreamOn(BufType::VideoOutput))?;
    dev.ioctl(&mut Ioctl::StreamOn(BufType::VideoCapture))?;

    let mut report = Report::default();
    let started = Instant::now();
    for n in 0..cli.frames {
        let slot = (n % outputs.len() as u32) as usize;
        let frame = frame_bytes(n, cli.frame_size as usize);

        let output = &mut outputs[slot];
        output.bytes_mut()[..frame.len()].copy_from_slice(&frame);
        let mut queued = Ioctl::QBuf(output.descriptor(BufType::VideoOutput, frame.len() as u32));
        dev.ioctl(&mut queued)
            .with_context(|| format!("queueing output {slot}"))?;

        let capture = &mut captures[slot];
        capture.bytes_mut().fill(0);
        let mut queued = Ioctl::QBuf(capture.descriptor(BufType::VideoCapture, 0));
        dev.ioctl(&mut queued)
            .with_context(|| format!("queueing capture {slot}"))?;

        dequeue(dev, BufType::VideoOutput, memory)?;
        let decoded = dequeue(dev, BufType::VideoCapture, memory)?;
        let Some(capture) = captures.iter_mut().find(|s| s.index == decoded.index) else {
            bail!("capture dequeued unknown slot {}", decoded.index);
        };
        let used = decoded.planes.first().map_or(0, |p| p.bytes_used) as usize;
        if used != frame.len() || capture.bytes_mut()[..used] != frame[..] {
            warn!(frame = n, used, "frame mismatch");
            report.mismatches += 1;
        }
        debug!(frame = n, slot, used, "frame looped");
        report.frames += 1;
        report.bytes += frame.len() as u64;
    }
    report.elapsed = started.elapsed();

    dev.ioctl(&mut Ioctl::StreamOff(BufType::VideoOutput))?;
    dev.ioctl(&mut Ioctl::StreamOff(BufType::VideoCapture))?;
    release(dev, BufType::VideoOutput, memory, outputs)?;
    release(dev, BufType::VideoCapture, memory, captures)?;
    Ok(report)
}

/// Sets the frame size, requests buffers and prepares client memory for each slot.
fn setup_port(
    dev: &VideoDeviceClient,
    buf_type: BufType,
    memory: MemoryType,
    cli: &Cli,
) -> Result<Vec<Slot>> {
    let mut format = Format::new(buf_type, 320, 240, u32::from_le_bytes(*b"NV12"));
    format.planes.push(PlaneFormat {
        size_image: cli.frame_size,
        bytes_per_line: 320,
    });
    dev.ioctl(&mut Ioctl::SFmt(format))
        .with_context(|| format!("setting format on {buf_type:?}"))?;

    let mut req = Ioctl::ReqBufs(RequestBuffers {
        count: cli.buffers,
        buf_type,
        memory,
        capabilities: 0,
    });
    dev.ioctl(&mut req)
        .with_context(|| format!("requesting buffers on {buf_type:?}"))?;
    let Ioctl::ReqBufs(granted) = req else {
        bail!("REQBUFS answered with another command");
    };
    ensure!(granted.count > 0, "device granted no {buf_type:?} buffers");
    info!(?buf_type, count = granted.count, "buffers granted");

    (0..granted.count)
        .map(|index| -> Result<Slot> {
            let mut query = Ioctl::QueryBuf(
                Buffer::new(buf_type, memory, index)
                    .with_planes([Plane::new(0, PlaneMemory::MemOffset(0))]),
            );
            dev.ioctl(&mut query)?;
            let plane = query
                .buffer()
                .and_then(|buf| buf.planes.first().copied())
                .context("QUERYBUF returned no planes")?;
            let len = plane.length as usize;
            ensure!(
                len >= cli.frame_size as usize,
                "slot {index} holds {len} bytes, frames need {}",
                cli.frame_size
            );
            let memory = match memory {
                MemoryType::Mmap => {
                    let offset = plane.m.mem_offset().context("mapped plane without offset")?;
                    let addr = dev.mmap(
                        0,
                        len,
                        prot::READ | prot::WRITE,
                        map_flags::SHARED,
                        offset,
                    )?;
                    SlotMemory::Mapped { addr, len }
                }
                _ => SlotMemory::User(vec![0u8; len]),
            };
            Ok(Slot {
                index,
                plane,
                memory,
            })
        })
        .collect()
}

fn dequeue(dev: &VideoDeviceClient, buf_type: BufType, memory: MemoryType) -> Result<Buffer> {
    let placeholder = match memory {
        MemoryType::Mmap => PlaneMemory::MemOffset(0),
        _ => PlaneMemory::UserPtr(0),
    };
    let mut cmd = Ioctl::DqBuf(
        Buffer::new(buf_type, memory, 0).with_planes([Plane::new(0, placeholder)]),
    );
    dev.ioctl(&mut cmd)
        .with_context(|| format!("dequeueing {buf_type:?}"))?;
    match cmd {
        Ioctl::DqBuf(buf) => Ok(buf),
        _ => bail!("DQBUF answered with another command"),
    }
}

fn release(
    dev: &VideoDeviceClient,
    buf_type: BufType,
    memory: MemoryType,
    slots: Vec<Slot>,
) -> Result<()> {
    for slot in slots {
        if let SlotMemory::Mapped { addr, len } = slot.memory {
            dev.munmap(addr, len)?;
        }
    }
    dev.ioctl(&mut Ioctl::ReqBufs(RequestBuffers {
        count: 0,
        buf_type,
        memory,
        capabilities: 0,
    }))?;
    Ok(())
}

fn frame_bytes(n: u32, len: usize) -> Vec<u8> {
    let seed = n.to_le_bytes();
    (0..len)
        .map(|i| seed[i % 4] ^ (i as u8).wrapping_mul(17))
        .collect()
}

fn parse_u32(input: &str) -> Result<u32, String> {
    if let Some(stripped) = input.strip_prefix("0x") {
        u32::from_str_radix(stripped, 16).map_err(|_| format!("invalid hex value '{input}'"))
    } else {
        input
            .parse::<u32>()
            .map_err(|_| format!("invalid number '{input}'"))
    }
}
