//! Bus surface used by nodes: registration, lookup, calls, signals, and
//! peer death notification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::error::TransportResult;
use crate::message::{error_names, Message};

pub type BusResult<T> = Result<T, BusError>;

/// Unique name of one bus connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":1.{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MatchId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Machine-readable category of a bus failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusErrorKind {
    AccessDenied,
    NoReply,
    ServiceUnknown,
    NameTaken,
    Disconnected,
    Failed,
}

impl BusErrorKind {
    pub fn error_name(self) -> &'static str {
        match self {
            BusErrorKind::AccessDenied => error_names::ACCESS_DENIED,
            BusErrorKind::NoReply | BusErrorKind::Disconnected => error_names::NO_REPLY,
            BusErrorKind::ServiceUnknown => error_names::SERVICE_UNKNOWN,
            BusErrorKind::NameTaken | BusErrorKind::Failed => error_names::FAILED,
        }
    }

    fn from_error_name(name: &str) -> Self {
        match name {
            error_names::ACCESS_DENIED => BusErrorKind::AccessDenied,
            error_names::NO_REPLY => BusErrorKind::NoReply,
            error_names::SERVICE_UNKNOWN => BusErrorKind::ServiceUnknown,
            _ => BusErrorKind::Failed,
        }
    }
}

/// A call that produced no usable reply.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {text}")]
pub struct BusError {
    pub kind: BusErrorKind,
    pub text: String,
}

impl BusError {
    pub fn new(kind: BusErrorKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Converts an error reply into a [`BusError`].
    pub fn from_reply(reply: &Message) -> Self {
        match reply.error_info() {
            Some((name, text)) => Self::new(BusErrorKind::from_error_name(name), text),
            None => Self::new(BusErrorKind::Failed, "malformed error reply"),
        }
    }
}

/// Service resolved through [`Bus::lookup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub owner: ConnectionId,
}

/// Handle returned by [`Bus::request_name`]; pass it back to release the name.
#[derive(Debug, PartialEq, Eq)]
pub struct Registration {
    pub service: String,
    pub path: String,
}

/// Replies to a delivered call. Dropping it without sending makes the
/// caller observe a missing reply.
#[derive(Debug)]
pub struct ReplySender {
    tx: Option<Sender<Message>>,
}

impl ReplySender {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Reply sender for fire-and-forget calls.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn expects_reply(&self) -> bool {
        self.tx.is_some()
    }

    pub fn send(mut self, reply: Message) {
        if let Some(tx) = self.tx.take() {
            // The caller may already have timed out; a closed channel is fine.
            let _ = tx.send(reply);
        }
    }
}

/// Something the bus hands to the thread owning a service or match.
#[derive(Debug)]
pub enum Delivery {
    Call { message: Message, reply: ReplySender },
    Signal(Message),
}

/// Receives deliveries for a registered service or signal match.
///
/// Implementations queue the delivery onto their owning thread; they must not
/// run handlers inline on the caller's thread.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, delivery: Delivery) -> TransportResult<()>;
}

/// Death notification callback, invoked on the bus's own thread.
pub type PeerCallback = Box<dyn FnOnce(ConnectionId) + Send>;

/// Connection-level bus operations.
pub trait Bus: Send + Sync {
    /// Unique name of this connection.
    fn unique_name(&self) -> ConnectionId;

    /// Process id of the connection's owner.
    fn pid(&self) -> u32;

    /// Registers `service` at `path`; calls are queued onto `sink`.
    fn request_name(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        sink: Arc<dyn DeliverySink>,
    ) -> BusResult<Registration>;

    fn release_name(&self, registration: &Registration);

    fn lookup(&self, service: &str) -> BusResult<RemoteObject>;

    /// Sends a call and blocks until the reply arrives or `timeout` elapses.
    fn call(
        &self,
        target: &RemoteObject,
        message: Message,
        timeout: Duration,
    ) -> BusResult<Message>;

    /// Sends a call without waiting for its reply.
    fn send(&self, target: &RemoteObject, message: Message) -> BusResult<()>;

    /// Delivers signals whose member equals `member` to `sink`.
    fn add_match(&self, member: &str, sink: Arc<dyn DeliverySink>) -> BusResult<MatchId>;

    fn remove_match(&self, id: MatchId);

    /// Broadcasts a signal; returns the number of sinks reached.
    fn emit(&self, message: Message) -> BusResult<usize>;

    /// Invokes `callback` once `peer` disconnects.
    fn watch_peer(&self, peer: ConnectionId, callback: PeerCallback) -> BusResult<WatchId>;

    fn unwatch_peer(&self, id: WatchId);
}
