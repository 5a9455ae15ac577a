//! Node lifecycle substrate.
//!
//! A [`Node`] owns one worker thread running a [`Looper`]. On that thread it
//! either publishes an object as a bus service ([`ServerRole`]) or resolves a
//! service and builds a proxy for it ([`ClientRole`]). [`SignalRelay`] moves
//! asynchronous notifications onto a node's thread.

mod error;
mod looper;
mod names;
mod node;
mod relay;

pub use error::{NodeError, NodeResult};
pub use looper::{CallHandler, LoopHandle, Looper, SignalRoute, Task};
pub use names::ServiceNames;
pub use node::{
    ClientFactory, ClientRole, Node, NodeContext, NodeObject, NodeRole, ServerFactory, ServerRole,
};
pub use relay::{SignalHandler, SignalRelay};
