//! End-to-end suite for the device bridge: a local bus, the device server
//! with the mock decoder behind it, and clients driving it over calls.

#[cfg(all(test, not(target_arch = "wasm32")))]
mod harness;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod buffer_bridge;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod lifecycle;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod failures;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use device_abi::{BufType, Capability, Ioctl, MemoryType, VideoDevice};

    use crate::harness::{
        dequeue, map_buffer, mapped_buffer, mapped_bytes, pattern, request_buffers, Bridge,
    };

    #[test]
    fn querycap_reports_the_backend() {
        let bridge = Bridge::start();
        let (_conn, client) = bridge.client();
        assert!(client.open("decoder", 0));

        let mut cap = Ioctl::QueryCap(Capability::default());
        client.ioctl(&mut cap).unwrap();
        let Ioctl::QueryCap(cap) = cap else {
            panic!("wrong reply");
        };
        assert_eq!(cap.driver, "vdev-mock");
    }

    #[test]
    fn two_clients_get_separate_devices() {
        let bridge = Bridge::start();
        let (_a_conn, a) = bridge.client();
        let (_b_conn, b) = bridge.client();
        assert_ne!(a.id(), b.id());
        assert!(a.open("decoder", 0));
        assert!(b.open("decoder", 0));
        assert_eq!(bridge.mocks.len(), 2);

        a.set_parameter("mode", "a").unwrap();
        let handles = bridge.mocks.handles();
        assert_eq!(handles[0].parameter("mode").as_deref(), Some("a"));
        assert_eq!(handles[1].parameter("mode"), None);
    }

    // Slow tests must be marked #[ignore] and prefixed with "slow_".
    #[test]
    #[ignore]
    fn slow_stream_many_frames() {
        const FRAMES: usize = 2_000;
        let bridge = Bridge::start();
        let (_conn, client) = bridge.client();
        assert!(client.open("decoder", 0));
        request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 4);
        request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 4);
        let outputs: Vec<_> = (0..4)
            .map(|i| map_buffer(&client, BufType::VideoOutput, i))
            .collect();
        let captures: Vec<_> = (0..4)
            .map(|i| map_buffer(&client, BufType::VideoCapture, i))
            .collect();

        for n in 0..FRAMES {
            let slot = (n % 4) as u32;
            let (out_addr, out_plane) = outputs[slot as usize];
            let (cap_addr, cap_plane) = captures[slot as usize];
            let frame = pattern(512 + n % 1024, n as u8);
            // SAFETY: every slot stays mapped for the whole loop.
            unsafe { mapped_bytes(out_addr, frame.len()) }.copy_from_slice(&frame);
            client
                .ioctl(&mut Ioctl::QBuf(mapped_buffer(
                    BufType::VideoOutput,
                    slot,
                    out_plane,
                    frame.len() as u32,
                )))
                .unwrap();
            client
                .ioctl(&mut Ioctl::QBuf(mapped_buffer(
                    BufType::VideoCapture,
                    slot,
                    cap_plane,
                    0,
                )))
                .unwrap();
            dequeue(&client, BufType::VideoOutput, MemoryType::Mmap).unwrap();
            let decoded = dequeue(&client, BufType::VideoCapture, MemoryType::Mmap).unwrap();
            assert_eq!(decoded.index, slot);
            // SAFETY: as above.
            assert_eq!(unsafe { mapped_bytes(cap_addr, frame.len()) }, frame.as_slice());
        }
        assert_eq!(bridge.mock().observed_frames().len(), FRAMES);
    }
}
