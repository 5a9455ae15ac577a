//! In-process bus.
//!
//! [`LocalBus`] is the broker; every participant holds a [`LocalConnection`]
//! implementing [`Bus`]. Calls are queued onto the registered service's
//! [`DeliverySink`] and the caller blocks on a one-slot reply channel.
//! Death notifications run on a dedicated notifier thread owned by the bus,
//! never on the thread that closed the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::bus::{
    Bus, BusError, BusErrorKind, BusResult, ConnectionId, Delivery, DeliverySink, MatchId,
    PeerCallback, Registration, RemoteObject, ReplySender, WatchId,
};
use crate::error::{TransportError, TransportResult};
use crate::message::Message;

type NotifierJob = Box<dyn FnOnce() + Send>;

struct NameEntry {
    owner: ConnectionId,
    path: String,
    interface: String,
    sink: Arc<dyn DeliverySink>,
}

struct MatchEntry {
    owner: ConnectionId,
    member: String,
    sink: Arc<dyn DeliverySink>,
}

struct WatchEntry {
    watcher: ConnectionId,
    peer: ConnectionId,
    callback: PeerCallback,
}

struct BusState {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, u32>>,
    names: Mutex<HashMap<String, NameEntry>>,
    matches: Mutex<HashMap<u64, MatchEntry>>,
    watches: Mutex<HashMap<u64, WatchEntry>>,
    denied: Mutex<Vec<(String, u32)>>,
    notifier: Sender<NotifierJob>,
}

impl BusState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_denied(&self, service: &str, pid: u32) -> bool {
        self.denied
            .lock()
            .iter()
            .any(|(prefix, denied_pid)| *denied_pid == pid && service.starts_with(prefix.as_str()))
    }

    fn notify(&self, peer: ConnectionId, callback: PeerCallback) {
        if self.notifier.send(Box::new(move || callback(peer))).is_err() {
            warn!("bus notifier stopped; dropping death notification for {peer}");
        }
    }
}

/// In-process message bus shared by every [`LocalConnection`].
#[derive(Clone)]
pub struct LocalBus {
    state: Arc<BusState>,
}

impl LocalBus {
    /// Creates a bus and starts its notifier thread.
    pub fn new() -> TransportResult<Self> {
        let (notifier, jobs) = unbounded::<NotifierJob>();
        thread::Builder::new()
            .name("local-bus-notifier".into())
            .spawn(move || {
                for job in jobs {
                    job();
                }
            })
            .map_err(TransportError::NotifierSpawn)?;

        Ok(Self {
            state: Arc::new(BusState {
                next_id: AtomicU64::new(1),
                connections: Mutex::new(HashMap::new()),
                names: Mutex::new(HashMap::new()),
                matches: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                denied: Mutex::new(Vec::new()),
                notifier,
            }),
        })
    }

    /// Opens a connection owned by the current process.
    pub fn connect(&self) -> Arc<LocalConnection> {
        self.connect_as_pid(std::process::id())
    }

    /// Opens a connection that reports `pid` as its owner.
    pub fn connect_as_pid(&self, pid: u32) -> Arc<LocalConnection> {
        let id = ConnectionId(self.state.next_id());
        self.state.connections.lock().insert(id, pid);
        debug!("bus connection {id} opened (pid {pid})");
        Arc::new(LocalConnection {
            id,
            pid,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }

    /// Rejects calls from `pid` to every service whose name starts with `service_prefix`.
    pub fn deny(&self, service_prefix: &str, pid: u32) {
        self.state
            .denied
            .lock()
            .push((service_prefix.to_owned(), pid));
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.state.names.lock().contains_key(service)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().len()
    }
}

/// One participant on a [`LocalBus`].
pub struct LocalConnection {
    id: ConnectionId,
    pid: u32,
    state: Arc<BusState>,
    closed: AtomicBool,
}

impl LocalConnection {
    /// Closes the connection: its names and matches are released and peers
    /// watching it are notified on the bus notifier thread.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        self.state.connections.lock().remove(&id);
        self.state.names.lock().retain(|_, entry| entry.owner != id);
        self.state.matches.lock().retain(|_, entry| entry.owner != id);

        let fired: Vec<PeerCallback> = {
            let mut watches = self.state.watches.lock();
            let ids: Vec<u64> = watches
                .iter()
                .filter(|(_, w)| w.peer == id || w.watcher == id)
                .map(|(watch_id, _)| *watch_id)
                .collect();
            ids.into_iter()
                .filter_map(|watch_id| watches.remove(&watch_id))
                .filter(|w| w.peer == id)
                .map(|w| w.callback)
                .collect()
        };
        debug!(
            "bus connection {id} closed, {} death notification(s) pending",
            fired.len()
        );
        for callback in fired {
            self.state.notify(id, callback);
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::new(
                BusErrorKind::Disconnected,
                format!("connection {} is closed", self.id),
            ))
        }
    }

    fn route(&self, target: &RemoteObject) -> BusResult<Arc<dyn DeliverySink>> {
        self.ensure_open()?;
        let names = self.state.names.lock();
        let entry = names
            .get(&target.service)
            .filter(|entry| entry.path == target.path)
            .ok_or_else(|| {
                BusError::new(
                    BusErrorKind::ServiceUnknown,
                    format!("{} is not registered at {}", target.service, target.path),
                )
            })?;
        if self.state.is_denied(&target.service, self.pid) {
            return Err(BusError::new(
                BusErrorKind::AccessDenied,
                format!("pid {} may not call {}", self.pid, target.service),
            ));
        }
        Ok(Arc::clone(&entry.sink))
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Bus for LocalConnection {
    fn unique_name(&self) -> ConnectionId {
        self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn request_name(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        sink: Arc<dyn DeliverySink>,
    ) -> BusResult<Registration> {
        self.ensure_open()?;
        let mut names = self.state.names.lock();
        if names.contains_key(service) {
            return Err(BusError::new(
                BusErrorKind::NameTaken,
                format!("{service} is already owned"),
            ));
        }
        names.insert(
            service.to_owned(),
            NameEntry {
                owner: self.id,
                path: path.to_owned(),
                interface: interface.to_owned(),
                sink,
            },
        );
        debug!("{} registered {service} at {path}", self.id);
        Ok(Registration {
            service: service.to_owned(),
            path: path.to_owned(),
        })
    }

    fn release_name(&self, registration: &Registration) {
        let mut names = self.state.names.lock();
        let owned = names
            .get(&registration.service)
            .is_some_and(|entry| entry.owner == self.id);
        if owned {
            names.remove(&registration.service);
            debug!("{} released {}", self.id, registration.service);
        }
    }

    fn lookup(&self, service: &str) -> BusResult<RemoteObject> {
        self.ensure_open()?;
        let names = self.state.names.lock();
        let entry = names.get(service).ok_or_else(|| {
            BusError::new(
                BusErrorKind::ServiceUnknown,
                format!("{service} is not registered"),
            )
        })?;
        Ok(RemoteObject {
            service: service.to_owned(),
            path: entry.path.clone(),
            interface: entry.interface.clone(),
            owner: entry.owner,
        })
    }

    fn call(
        &self,
        target: &RemoteObject,
        mut message: Message,
        timeout: Duration,
    ) -> BusResult<Message> {
        let sink = self.route(target)?;
        message.set_sender(self.id);
        let member = message.member().to_owned();
        let (tx, rx) = bounded(1);
        sink.deliver(Delivery::Call {
            message,
            reply: ReplySender::new(tx),
        })
        .map_err(|err| BusError::new(BusErrorKind::NoReply, err.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(reply) if reply.is_error() => Err(BusError::from_reply(&reply)),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(BusError::new(
                BusErrorKind::NoReply,
                format!("{member} on {} timed out after {timeout:?}", target.service),
            )),
            Err(RecvTimeoutError::Disconnected) => Err(BusError::new(
                BusErrorKind::NoReply,
                format!("{} dropped {member} without replying", target.service),
            )),
        }
    }

    fn send(&self, target: &RemoteObject, mut message: Message) -> BusResult<()> {
        let sink = self.route(target)?;
        message.set_sender(self.id);
        sink.deliver(Delivery::Call {
            message,
            reply: ReplySender::discard(),
        })
        .map_err(|err| BusError::new(BusErrorKind::NoReply, err.to_string()))
    }

    fn add_match(&self, member: &str, sink: Arc<dyn DeliverySink>) -> BusResult<MatchId> {
        self.ensure_open()?;
        let id = self.state.next_id();
        self.state.matches.lock().insert(
            id,
            MatchEntry {
                owner: self.id,
                member: member.to_owned(),
                sink,
            },
        );
        Ok(MatchId(id))
    }

    fn remove_match(&self, id: MatchId) {
        self.state.matches.lock().remove(&id.0);
    }

    fn emit(&self, mut message: Message) -> BusResult<usize> {
        self.ensure_open()?;
        message.set_sender(self.id);
        let sinks: Vec<Arc<dyn DeliverySink>> = self
            .state
            .matches
            .lock()
            .values()
            .filter(|entry| entry.member == message.member())
            .map(|entry| Arc::clone(&entry.sink))
            .collect();
        let mut reached = 0;
        for sink in sinks {
            match sink.deliver(Delivery::Signal(message.clone())) {
                Ok(()) => reached += 1,
                Err(err) => warn!("signal {} not delivered: {err}", message.member()),
            }
        }
        Ok(reached)
    }

    fn watch_peer(&self, peer: ConnectionId, callback: PeerCallback) -> BusResult<WatchId> {
        self.ensure_open()?;
        let id = self.state.next_id();
        let alive = self.state.connections.lock().contains_key(&peer);
        if !alive {
            self.state.notify(peer, callback);
            return Ok(WatchId(id));
        }
        self.state.watches.lock().insert(
            id,
            WatchEntry {
                watcher: self.id,
                peer,
                callback,
            },
        );
        Ok(WatchId(id))
    }

    fn unwatch_peer(&self, id: WatchId) {
        self.state.watches.lock().remove(&id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::error_names;
    use crossbeam_channel::Receiver;
    use std::sync::mpsc;

    /// Sink that answers calls on its own thread with a fixed status.
    struct EchoSink {
        tx: Sender<Delivery>,
    }

    impl DeliverySink for EchoSink {
        fn deliver(&self, delivery: Delivery) -> TransportResult<()> {
            self.tx
                .send(delivery)
                .map_err(|_| TransportError::SinkClosed("echo".into()))
        }
    }

    fn spawn_echo() -> (Arc<EchoSink>, thread::JoinHandle<()>) {
        let (tx, rx): (Sender<Delivery>, Receiver<Delivery>) = unbounded();
        let worker = thread::spawn(move || {
            for delivery in rx {
                if let Delivery::Call { mut message, reply } = delivery {
                    let value = message.read_i32().unwrap_or(-1);
                    let mut out = Message::method_return(&message);
                    out.append_i32(value * 2);
                    reply.send(out);
                }
            }
        });
        (Arc::new(EchoSink { tx }), worker)
    }

    fn remote(conn: &LocalConnection, service: &str) -> RemoteObject {
        conn.lookup(service).expect("lookup")
    }

    #[test]
    fn call_round_trips_through_sink() {
        let bus = LocalBus::new().unwrap();
        let server = bus.connect();
        let client = bus.connect();
        let (sink, _worker) = spawn_echo();
        server
            .request_name("org.vdev.Echo", "/org/vdev/Echo", "org.vdev.Echo", sink)
            .unwrap();

        let target = remote(&client, "org.vdev.Echo");
        let mut call = Message::method_call("org.vdev.Echo", "double");
        call.append_i32(21);
        let mut reply = client
            .call(&target, call, Duration::from_secs(1))
            .expect("reply");
        assert_eq!(reply.read_i32().unwrap(), 42);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let bus = LocalBus::new().unwrap();
        let a = bus.connect();
        let b = bus.connect();
        let (sink, _worker) = spawn_echo();
        a.request_name("org.vdev.Echo", "/e", "org.vdev.Echo", sink.clone())
            .unwrap();
        let err = b
            .request_name("org.vdev.Echo", "/e", "org.vdev.Echo", sink)
            .unwrap_err();
        assert_eq!(err.kind, BusErrorKind::NameTaken);
    }

    #[test]
    fn denied_pid_gets_access_denied() {
        let bus = LocalBus::new().unwrap();
        let server = bus.connect();
        let client = bus.connect_as_pid(4242);
        let (sink, _worker) = spawn_echo();
        server
            .request_name("org.vdev.Echo", "/e", "org.vdev.Echo", sink)
            .unwrap();
        bus.deny("org.vdev.Echo", 4242);

        let target = remote(&client, "org.vdev.Echo");
        let err = client
            .call(
                &target,
                Message::method_call("org.vdev.Echo", "double"),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert_eq!(err.kind, BusErrorKind::AccessDenied);
        assert_eq!(err.kind.error_name(), error_names::ACCESS_DENIED);
    }

    #[test]
    fn call_without_reply_times_out() {
        struct Blackhole(Mutex<Vec<Delivery>>);
        impl DeliverySink for Blackhole {
            fn deliver(&self, delivery: Delivery) -> TransportResult<()> {
                self.0.lock().push(delivery);
                Ok(())
            }
        }

        let bus = LocalBus::new().unwrap();
        let server = bus.connect();
        let client = bus.connect();
        server
            .request_name(
                "org.vdev.Hole",
                "/h",
                "org.vdev.Hole",
                Arc::new(Blackhole(Mutex::new(Vec::new()))),
            )
            .unwrap();
        let target = remote(&client, "org.vdev.Hole");
        let err = client
            .call(
                &target,
                Message::method_call("org.vdev.Hole", "x"),
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert_eq!(err.kind, BusErrorKind::NoReply);
    }

    #[test]
    fn disconnect_releases_names_and_notifies_watchers() {
        let bus = LocalBus::new().unwrap();
        let server = bus.connect();
        let client = bus.connect();
        let (sink, _worker) = spawn_echo();
        client
            .request_name("org.vdev.Client", "/c", "org.vdev.Client", sink)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let test_thread = thread::current().id();
        server
            .watch_peer(
                client.unique_name(),
                Box::new(move |peer| {
                    tx.send((peer, thread::current().id())).unwrap();
                }),
            )
            .unwrap();

        let client_id = client.unique_name();
        client.disconnect();
        let (peer, thread_id) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(peer, client_id);
        assert_ne!(thread_id, test_thread);
        assert!(!bus.has_service("org.vdev.Client"));
        assert_eq!(bus.connection_count(), 1);
    }

    #[test]
    fn signals_reach_matching_sinks_only() {
        let bus = LocalBus::new().unwrap();
        let listener = bus.connect();
        let emitter = bus.connect();
        let (tx, rx) = unbounded();
        struct Collect(Sender<Delivery>);
        impl DeliverySink for Collect {
            fn deliver(&self, delivery: Delivery) -> TransportResult<()> {
                self.0
                    .send(delivery)
                    .map_err(|_| TransportError::SinkClosed("collect".into()))
            }
        }
        listener
            .add_match("org.vdev.Dev.7.Relay", Arc::new(Collect(tx)))
            .unwrap();

        let hits = emitter
            .emit(Message::signal("org.vdev.Dev", "org.vdev.Dev.7.Relay"))
            .unwrap();
        let misses = emitter
            .emit(Message::signal("org.vdev.Dev", "org.vdev.Dev.8.Relay"))
            .unwrap();
        assert_eq!((hits, misses), (1, 0));
        match rx.try_recv().unwrap() {
            Delivery::Signal(msg) => assert_eq!(msg.sender(), Some(emitter.unique_name())),
            other => panic!("unexpected delivery {other:?}"),
        }
    }
}
