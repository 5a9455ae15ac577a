#![cfg(all(test, not(target_arch = "wasm32")))]

use device_abi::{BufType, Ioctl, MemoryType, PlaneMemory, Port, VideoDevice};
use services_device::BufferKey;

use crate::harness::{
    dequeue, map_buffer, mapped_buffer, mapped_bytes, pattern, request_buffers, user_buffer,
    Bridge,
};

#[test]
fn reqbufs_reserves_one_server_entry_per_slot() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    let granted = request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 4);
    assert_eq!(granted, 4);

    let instance = bridge.instance(client.id());
    let expected: Vec<_> = (0..4).map(|i| BufferKey::new(Port::Output, i, 0)).collect();
    assert_eq!(instance.buffer_keys(), expected);
}

#[test]
fn queued_output_bytes_reach_the_backend() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 4);

    let (addr, plane) = map_buffer(&client, BufType::VideoOutput, 0);
    assert_eq!(bridge.segment_files(), 1);
    let segment = std::fs::read_dir(bridge.shm_dir())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(segment.metadata().unwrap().len(), u64::from(plane.length));
    assert_eq!(bridge.mock().mapped_count(), 1);

    let frame = pattern(1024, 7);
    // SAFETY: `addr` maps `plane.length` bytes until munmap.
    unsafe { mapped_bytes(addr, frame.len()) }.copy_from_slice(&frame);
    client
        .ioctl(&mut Ioctl::QBuf(mapped_buffer(
            BufType::VideoOutput,
            0,
            plane,
            frame.len() as u32,
        )))
        .unwrap();

    assert_eq!(bridge.mock().observed_frames(), vec![frame]);
}

#[test]
fn mapped_frames_round_trip_through_capture() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 2);
    request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 2);
    let (out_addr, out_plane) = map_buffer(&client, BufType::VideoOutput, 1);
    let (cap_addr, cap_plane) = map_buffer(&client, BufType::VideoCapture, 0);

    let frame = pattern(3000, 42);
    // SAFETY: both addresses stay mapped for the rest of the test.
    unsafe { mapped_bytes(out_addr, frame.len()) }.copy_from_slice(&frame);
    client
        .ioctl(&mut Ioctl::QBuf(mapped_buffer(
            BufType::VideoOutput,
            1,
            out_plane,
            frame.len() as u32,
        )))
        .unwrap();
    client
        .ioctl(&mut Ioctl::QBuf(mapped_buffer(BufType::VideoCapture, 0, cap_plane, 0)))
        .unwrap();
    assert!(client.poll(true).unwrap());

    let done = dequeue(&client, BufType::VideoOutput, MemoryType::Mmap).unwrap();
    assert_eq!(done.index, 1);

    let decoded = dequeue(&client, BufType::VideoCapture, MemoryType::Mmap).unwrap();
    assert_eq!(decoded.index, 0);
    assert_eq!(decoded.planes[0].bytes_used as usize, frame.len());
    // SAFETY: as above.
    let captured = unsafe { mapped_bytes(cap_addr, frame.len()) };
    assert_eq!(captured, frame.as_slice());
}

#[test]
fn user_pointer_frames_round_trip() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::UserPtr, 2);
    request_buffers(&client, BufType::VideoCapture, MemoryType::UserPtr, 2);

    let mut input = pattern(4096, 3);
    let used = 2500;
    let mut output = vec![0u8; 4096];
    let input_ptr = input.as_mut_ptr() as u64;
    let output_ptr = output.as_mut_ptr() as u64;

    let mut queued = Ioctl::QBuf(user_buffer(BufType::VideoOutput, 0, &mut input, used));
    client.ioctl(&mut queued).unwrap();
    assert_eq!(
        queued.buffer().unwrap().planes[0].m,
        PlaneMemory::UserPtr(input_ptr)
    );
    client
        .ioctl(&mut Ioctl::QBuf(user_buffer(
            BufType::VideoCapture,
            1,
            &mut output,
            0,
        )))
        .unwrap();
    assert_eq!(bridge.mock().observed_frames(), vec![input[..used as usize].to_vec()]);

    let done = dequeue(&client, BufType::VideoOutput, MemoryType::UserPtr).unwrap();
    assert_eq!(done.planes[0].m, PlaneMemory::UserPtr(input_ptr));

    let decoded = dequeue(&client, BufType::VideoCapture, MemoryType::UserPtr).unwrap();
    assert_eq!(decoded.index, 1);
    assert_eq!(decoded.planes[0].m, PlaneMemory::UserPtr(output_ptr));
    assert_eq!(&output[..used as usize], &input[..used as usize]);
    assert!(output[used as usize..].iter().all(|b| *b == 0));
}

#[test]
fn munmap_erases_both_sides() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 2);
    let (addr, plane) = map_buffer(&client, BufType::VideoOutput, 0);
    let (_other, _) = map_buffer(&client, BufType::VideoOutput, 1);

    let proxy = client.device().unwrap();
    assert_eq!(proxy.mapped_count(), 2);
    assert!(proxy.magic(addr).is_some());

    client.munmap(addr, plane.length as usize).unwrap();
    assert_eq!(proxy.mapped_count(), 1);
    assert_eq!(proxy.magic(addr), None);
    assert_eq!(bridge.segment_files(), 1);
    assert_eq!(bridge.mock().mapped_count(), 1);
    assert_eq!(
        bridge.instance(client.id()).buffer_keys(),
        vec![BufferKey::new(Port::Output, 1, 0)]
    );

    assert!(client.munmap(addr, plane.length as usize).is_err());
}

#[test]
fn releasing_a_port_drops_its_segments() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 2);
    let (addr, plane) = map_buffer(&client, BufType::VideoCapture, 0);
    client.munmap(addr, plane.length as usize).unwrap();

    assert_eq!(
        request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 0),
        0
    );
    let instance = bridge.instance(client.id());
    assert_eq!(instance.buffer_count(), 0);
    assert_eq!(bridge.segment_files(), 0);
}

#[test]
fn mapping_needs_an_offset_from_querybuf() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 1);

    assert!(client.mmap(0, 4096, 0x3, 0x1, 0x1234_5000).is_err());
    assert_eq!(bridge.segment_files(), 0);
    assert_eq!(bridge.mock().mapped_count(), 0);
}
