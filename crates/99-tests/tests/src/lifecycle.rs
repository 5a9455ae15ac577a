#![cfg(all(test, not(target_arch = "wasm32")))]

use std::sync::Arc;
use std::thread;

use device_abi::{BufType, DeviceError, MemoryType, NodeId, VideoDevice, DEVICE_SERVICE};
use node_runtime::ServiceNames;
use parking_lot::Mutex;

use crate::harness::{map_buffer, request_buffers, wait_until, Bridge};

fn device_service(id: NodeId) -> String {
    ServiceNames::new(DEVICE_SERVICE, Some(id.0))
        .service()
        .to_owned()
}

#[test]
fn client_death_releases_buffers_and_node() {
    let bridge = Bridge::start();
    let (conn, client) = bridge.client();
    let id = client.id();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoOutput, MemoryType::Mmap, 4);
    for index in 0..4 {
        map_buffer(&client, BufType::VideoOutput, index);
    }
    let instance = bridge.instance(id);
    assert_eq!(instance.buffer_count(), 4);
    let mock = bridge.mock();
    assert_eq!(mock.mapped_count(), 4);
    let registry = bridge.server.registry().unwrap();

    conn.disconnect();

    wait_until("buffer release", || instance.buffer_count() == 0);
    wait_until("node removal", || !registry.contains(id));
    wait_until("unpublish", || !bridge.bus.has_service(&device_service(id)));
    assert_eq!(mock.mapped_count(), 0);
    assert!(!mock.is_open());
    drop(instance);
    wait_until("instance drop", || bridge.server.instance(id).is_none());

    drop(client);
}

#[test]
fn dropping_the_session_destroys_the_node() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    let id = client.id();
    assert!(bridge.bus.has_service(&device_service(id)));
    let registry = bridge.server.registry().unwrap();

    drop(client);

    wait_until("node removal", || !registry.contains(id));
    assert!(!bridge.bus.has_service(&device_service(id)));
}

#[test]
fn close_releases_everything_but_keeps_the_node() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    request_buffers(&client, BufType::VideoCapture, MemoryType::Mmap, 2);
    map_buffer(&client, BufType::VideoCapture, 0);

    assert!(client.close());
    assert_eq!(client.device().unwrap().mapped_count(), 0);
    assert_eq!(bridge.segment_files(), 0);
    let instance = bridge.instance(client.id());
    assert_eq!(instance.buffer_count(), 0);
    assert!(!instance.is_open());

    assert!(client.open("decoder", 0));
    assert_eq!(bridge.mock().open_count(), 2);
}

#[test]
fn ids_stay_unique_across_concurrent_sessions() {
    let bridge = Arc::new(Bridge::start_with_limit(12));
    let sessions = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let sessions = Arc::clone(&sessions);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                let conn = bridge.bus.connect();
                for _ in 0..4 {
                    match bridge.client_on(&conn) {
                        Ok(client) => sessions.lock().push(client),
                        Err(err) => failures.lock().push(err),
                    }
                }
                conn
            })
        })
        .collect();
    let connections: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let mut ids: Vec<_> = sessions.lock().iter().map(|s| s.id().0).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=12).collect::<Vec<_>>());
    let failures = failures.lock();
    assert_eq!(failures.len(), 4);
    assert!(failures
        .iter()
        .all(|err| matches!(err, DeviceError::Exhausted(_))));

    sessions.lock().clear();
    drop(connections);
}

#[test]
fn poll_interrupt_and_events() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));
    assert!(!client.poll(false).unwrap());

    bridge.mock().push_event(mock::eos_event());
    assert!(client.poll(false).unwrap());

    client.set_device_poll_interrupt().unwrap();
    assert!(!client.poll(true).unwrap());
    assert!(client.poll(true).unwrap());

    client.set_device_poll_interrupt().unwrap();
    client.clear_device_poll_interrupt().unwrap();
    assert!(client.poll(true).unwrap());
}

#[test]
fn parameters_reach_the_backend() {
    let bridge = Bridge::start();
    let (_conn, client) = bridge.client();
    assert!(client.open("decoder", 0));

    client.set_parameter("low-latency", "1").unwrap();
    assert_eq!(bridge.mock().parameter("low-latency").as_deref(), Some("1"));
    assert_eq!(
        client.set_parameter("", "x"),
        Err(DeviceError::Backend(mock::errno::EINVAL))
    );
}
