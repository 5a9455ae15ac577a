//! Signal relay: asynchronous notifications delivered on a node's own thread.
//!
//! Inbound, the relay registers one signal rule per connection and runs its
//! handler for every matching signal the bus delivers to the node's loop.
//! Outbound, [`SignalRelay::send_msg`] emulates delivery from any thread:
//! on the node thread the handler runs inline, elsewhere the caller posts a
//! task and blocks until the handler has finished. The handler and the
//! completion condition share one lock, so at most one relayed message per
//! target is in flight.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use transport::{Bus, MatchId, Message};

use crate::error::{NodeError, NodeResult};
use crate::looper::{LoopHandle, SignalRoute};
use crate::names::ServiceNames;

pub type SignalHandler = Box<dyn FnMut(Message) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Done,
    Abandoned,
}

struct RelayState {
    handler: SignalHandler,
    busy: bool,
    outcome: Option<Outcome>,
}

struct RelayInner {
    rule: String,
    interface: String,
    handle: LoopHandle,
    state: Mutex<RelayState>,
    cond: Condvar,
}

impl RelayInner {
    fn finish(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        self.cond.notify_all();
    }
}

impl SignalRoute for RelayInner {
    fn on_signal(&self, signal: Message) {
        if signal.member() != self.rule {
            warn!(rule = %self.rule, member = signal.member(), "relay rejected signal");
            return;
        }
        let mut state = self.state.lock();
        (state.handler)(signal);
    }
}

/// Queued cross-thread delivery. Dropping it unrun wakes the sender with an error.
struct Pending {
    inner: Arc<RelayInner>,
    signal: Option<Message>,
}

impl Pending {
    fn run(mut self) {
        if let Some(signal) = self.signal.take() {
            let mut state = self.inner.state.lock();
            (state.handler)(signal);
            state.outcome = Some(Outcome::Done);
            self.inner.cond.notify_all();
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.signal.is_some() {
            self.inner.finish(Outcome::Abandoned);
        }
    }
}

/// Per-connection signal rule plus its handler.
pub struct SignalRelay {
    inner: Arc<RelayInner>,
    bus: Arc<dyn Bus>,
    match_id: Option<MatchId>,
}

impl SignalRelay {
    /// Registers the relay rule for `names` on the bus and on `handle`'s loop.
    pub fn register(
        bus: Arc<dyn Bus>,
        handle: LoopHandle,
        names: &ServiceNames,
        handler: impl FnMut(Message) + Send + 'static,
    ) -> NodeResult<Self> {
        let inner = Arc::new(RelayInner {
            rule: names.relay_rule().to_owned(),
            interface: names.interface().to_owned(),
            handle: handle.clone(),
            state: Mutex::new(RelayState {
                handler: Box::new(handler),
                busy: false,
                outcome: None,
            }),
            cond: Condvar::new(),
        });
        handle.add_signal_route(&inner.rule, inner.clone());
        let match_id = match bus.add_match(&inner.rule, Arc::new(handle.clone())) {
            Ok(id) => id,
            Err(err) => {
                handle.remove_signal_route(&inner.rule);
                return Err(NodeError::Match(err));
            }
        };
        debug!(rule = %inner.rule, "relay registered");
        Ok(Self {
            inner,
            bus,
            match_id: Some(match_id),
        })
    }

    pub fn rule(&self) -> &str {
        &self.inner.rule
    }

    /// Builds a signal addressed to this relay's rule.
    pub fn new_signal(&self) -> Message {
        Message::signal(&self.inner.interface, &self.inner.rule)
    }

    /// Broadcasts `signal` over the bus; the handler runs later on the node thread.
    pub fn emit(&self, signal: Message) -> NodeResult<usize> {
        self.bus.emit(signal).map_err(NodeError::Match)
    }

    /// Runs the handler for `signal` on the node thread and returns once it has run.
    pub fn send_msg(&self, signal: Message) -> NodeResult<()> {
        let inner = &self.inner;
        if inner.handle.is_loop_thread() {
            let mut state = inner.state.lock();
            (state.handler)(signal);
            return Ok(());
        }

        let mut state = inner.state.lock();
        while state.busy {
            inner.cond.wait(&mut state);
        }
        state.busy = true;
        state.outcome = None;

        let pending = Pending {
            inner: Arc::clone(inner),
            signal: Some(signal),
        };
        // The task may be dropped unrun while we still hold the lock, so
        // post after releasing it.
        let posted = parking_lot::MutexGuard::unlocked(&mut state, || {
            inner.handle.post(move || pending.run())
        });

        let result = match posted {
            Ok(()) => {
                while state.outcome.is_none() {
                    inner.cond.wait(&mut state);
                }
                match state.outcome {
                    Some(Outcome::Done) => Ok(()),
                    _ => Err(NodeError::RelayAbandoned(inner.rule.clone())),
                }
            }
            Err(err) => Err(err),
        };
        state.busy = false;
        state.outcome = None;
        inner.cond.notify_all();
        result
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        if let Some(id) = self.match_id.take() {
            self.bus.remove_match(id);
        }
        self.inner.handle.remove_signal_route(&self.inner.rule);
    }
}
