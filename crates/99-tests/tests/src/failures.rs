#![cfg(all(test, not(target_arch = "wasm32")))]

use std::sync::Arc;

use device_abi::{
    device_methods, status, BufType, DeviceError, IoctlPayload, MemoryType, NodeId, Port,
    VideoDevice, DEVICE_SERVICE,
};
use node_runtime::ServiceNames;
use services_device::SegmentToken;
use transport::{Bus, LocalConnection, Message};
use transport_codecs::CallCodec;

use crate::harness::{request_buffers, Bridge};

const VIDIOC_UNKNOWN: u64 = 0xc004_5601;

/// A codec aimed straight at a device node, bypassing the proxy.
fn raw_codec(bridge: &Bridge, conn: &Arc<LocalConnection>, id: NodeId) -> CallCodec {
    let service = ServiceNames::new(DEVICE_SERVICE, Some(id.0));
    let remote = conn.lookup(service.service()).unwrap();
    CallCodec::new(conn.clone(), remote, bridge.config.call_timeout())
}

fn set_parameter_as(codec: &CallCodec, id: NodeId, key: &str) -> Result<(), DeviceError> {
    let mut call = codec.obtain(device_methods::SET_PARAMETER).unwrap();
    call.append_i32(id.to_wire()).append_str(key).append_str("on");
    codec.call_status(call)
}

/// An `mmap` call for capture slot 0 up to, but not including, the segment field.
fn mmap_call(codec: &CallCodec, id: NodeId) -> Message {
    let mut call = codec.obtain(device_methods::MMAP).unwrap();
    call.append_i32(id.to_wire())
        .append_i64(0)
        .append_i64(64)
        .append_i32(0x3)
        .append_i32(0x1)
        .append_i32(0)
        .append_i32(Port::Capture.raw())
        .append_i32(0)
        .append_i32(0);
    call
}

#[test]
fn mmap_only_attaches_segments_inside_the_segment_dir() {
    let bridge = Bridge::start();
    let (conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 1);

    let outside = tempfile::tempdir().unwrap();
    let victim = outside.path().join("victim");
    std::fs::write(&victim, [0u8; 64]).unwrap();
    let relative = format!(
        "../{}/victim",
        outside.path().file_name().unwrap().to_string_lossy()
    );

    let codec = raw_codec(&bridge, &conn, client.id());
    let mut by_name = mmap_call(&codec, client.id());
    by_name.append_str(&relative).append_i32(64);
    assert!(matches!(
        codec.call_with_results(by_name),
        Err(DeviceError::Protocol(_))
    ));

    let mut unknown = mmap_call(&codec, client.id());
    unknown.append_i64(SegmentToken::next().0 as i64).append_i32(64);
    assert!(matches!(
        codec.call_with_results(unknown),
        Err(DeviceError::Protocol(_))
    ));

    assert_eq!(bridge.mock().mapped_count(), 0);
    assert_eq!(std::fs::read(&victim).unwrap(), [0u8; 64]);
}

#[test]
fn unknown_ioctl_never_reaches_the_backend() {
    let bridge = Bridge::start();
    let (conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    let mock = bridge.mock();
    let before = mock.ioctl_count();

    let codec = raw_codec(&bridge, &conn, client.id());
    let mut call = codec.obtain(device_methods::IOCTL).unwrap();
    call.append_i32(client.id().to_wire())
        .append_i64(VIDIOC_UNKNOWN as i64)
        .append_bytes(&[0u8; 4]);
    assert!(matches!(codec.call_status(call), Err(DeviceError::Protocol(_))));

    let mut payload = IoctlPayload {
        request: VIDIOC_UNKNOWN,
        data: vec![0; 4],
        planes: None,
    };
    let proxy = client.device().unwrap();
    assert!(matches!(
        proxy.ioctl_payload(&mut payload),
        Err(DeviceError::Protocol(_))
    ));
    assert_eq!(mock.ioctl_count(), before);

    // The node keeps serving after the rejection.
    assert_eq!(
        request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 2),
        2
    );
}

#[test]
fn mismatched_node_id_is_rejected() {
    let bridge = Bridge::start();
    let (conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    let codec = raw_codec(&bridge, &conn, client.id());
    let wrong = NodeId(client.id().0 + 7);
    assert!(matches!(
        set_parameter_as(&codec, wrong, "tiling"),
        Err(DeviceError::Protocol(_))
    ));
    assert_eq!(bridge.mock().parameter("tiling"), None);

    set_parameter_as(&codec, client.id(), "tiling").unwrap();
    assert_eq!(bridge.mock().parameter("tiling").as_deref(), Some("on"));
}

#[test]
fn a_node_serves_only_its_first_caller() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    let intruder = bridge.bus.connect();
    let codec = raw_codec(&bridge, &intruder, client.id());
    assert!(matches!(
        set_parameter_as(&codec, client.id(), "tiling"),
        Err(DeviceError::Protocol(_))
    ));
    assert_eq!(bridge.mock().parameter("tiling"), None);

    // The intruder going away leaves the owner bound.
    intruder.disconnect();
    client.set_parameter("tiling", "off").unwrap();
}

#[test]
fn access_control_rejection_is_distinct() {
    let bridge = Bridge::start();
    bridge.bus.deny("org.vdev.VideoDevice", 4242);
    let conn = bridge.bus.connect_as_pid(4242);
    let client = bridge.client_on(&conn).unwrap();

    assert!(!client.open("decoder", 0));
    assert!(matches!(
        client.set_parameter("tiling", "on"),
        Err(DeviceError::PermissionDenied(_))
    ));
    assert!(bridge.mocks.is_empty());
}

#[test]
fn backend_status_is_returned_verbatim() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    bridge.mock().fail_next_ioctl(-5);
    let mut cmd = device_abi::Ioctl::StreamOn(BufType::VideoCapture);
    assert_eq!(client.ioctl(&mut cmd), Err(DeviceError::Backend(-5)));
    client.ioctl(&mut cmd).unwrap();

    // A backend value inside the reserved range is still a backend failure.
    bridge.mock().fail_next_ioctl(status::PERMISSION_DENIED);
    assert_eq!(
        client.ioctl(&mut cmd),
        Err(DeviceError::Backend(status::BACKEND_OUT_OF_RANGE))
    );
}

#[test]
fn calls_fail_once_the_server_stops() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    bridge.server.stop();

    assert!(matches!(
        client.set_parameter("tiling", "on"),
        Err(DeviceError::Bus(_))
    ));
    assert!(!client.open("decoder", 0));
}
