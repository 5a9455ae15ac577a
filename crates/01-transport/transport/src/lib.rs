//! Bus and shared-memory primitives consumed by the node runtime.
//!
//! This crate is the bottom layer of the device bridge:
//! * [`Message`] – positional, typed call/reply/signal payloads.
//! * [`Bus`] – service registration, lookup, blocking calls with a timeout,
//!   signal matches, and peer death notification.
//! * [`LocalBus`] – an in-process [`Bus`] implementation with an access
//!   policy and a notifier thread for death callbacks.
//! * [`SharedSegment`] – named, file-backed shared memory used to move bulk
//!   buffer payloads outside the control channel.

mod bus;
mod error;
mod local;
mod message;
mod segment;

pub use bus::{
    Bus, BusError, BusErrorKind, BusResult, ConnectionId, Delivery, DeliverySink, MatchId,
    PeerCallback, Registration, RemoteObject, ReplySender, WatchId,
};
pub use error::{TransportError, TransportResult};
pub use local::{LocalBus, LocalConnection};
pub use message::{error_names, Message, MessageKind, Value};
pub use segment::{default_segment_dir, SharedSegment};
