//! Per-thread cooperative run loop.
//!
//! Every node owns exactly one [`Looper`], drained by its worker thread.
//! Bus deliveries and posted tasks share one FIFO queue, so a task posted
//! after a call was delivered always runs after that call has been handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use transport::{
    error_names, Delivery, DeliverySink, Message, ReplySender, TransportError, TransportResult,
};

use crate::error::{NodeError, NodeResult};

/// Work queued onto a loop thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Answers method calls delivered to a loop.
pub trait CallHandler: Send + Sync {
    /// Produces the reply (or error reply) for `call`.
    fn handle_call(&self, call: Message) -> Message;
}

/// Receives signals whose member matches a registered route.
pub trait SignalRoute: Send + Sync {
    fn on_signal(&self, signal: Message);
}

enum LoopEvent {
    Task(Task),
    Deliver(Delivery),
    Quit,
}

struct LoopShared {
    name: String,
    thread: OnceLock<ThreadId>,
    quit: AtomicBool,
    handler: Mutex<Option<Arc<dyn CallHandler>>>,
    routes: Mutex<HashMap<String, Arc<dyn SignalRoute>>>,
}

/// Cloneable handle used to feed a [`Looper`] from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<LoopEvent>,
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `task` behind everything already delivered to the loop.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> NodeResult<()> {
        if self.shared.quit.load(Ordering::Acquire) {
            return Err(NodeError::LoopStopped(self.shared.name.clone()));
        }
        self.tx
            .send(LoopEvent::Task(Box::new(task)))
            .map_err(|_| NodeError::LoopStopped(self.shared.name.clone()))
    }

    /// Asks the loop to exit after the event it is currently processing.
    pub fn quit(&self) {
        if !self.shared.quit.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(LoopEvent::Quit);
        }
    }

    /// Events waiting behind the one the loop is processing.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.quit.load(Ordering::Acquire)
    }

    /// Whether the caller is the loop's own worker thread.
    pub fn is_loop_thread(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    pub fn set_call_handler(&self, handler: Arc<dyn CallHandler>) {
        *self.shared.handler.lock() = Some(handler);
    }

    pub fn clear_call_handler(&self) {
        self.shared.handler.lock().take();
    }

    pub fn add_signal_route(&self, member: &str, route: Arc<dyn SignalRoute>) {
        self.shared.routes.lock().insert(member.to_owned(), route);
    }

    pub fn remove_signal_route(&self, member: &str) {
        self.shared.routes.lock().remove(member);
    }
}

impl DeliverySink for LoopHandle {
    fn deliver(&self, delivery: Delivery) -> TransportResult<()> {
        if self.shared.quit.load(Ordering::Acquire) {
            return Err(TransportError::SinkClosed(self.shared.name.clone()));
        }
        self.tx
            .send(LoopEvent::Deliver(delivery))
            .map_err(|_| TransportError::SinkClosed(self.shared.name.clone()))
    }
}

/// The receiving half of a run loop; consumed by [`Looper::run`] on the worker thread.
pub struct Looper {
    rx: Receiver<LoopEvent>,
    handle: LoopHandle,
}

impl Looper {
    pub fn new(name: impl Into<String>) -> (Looper, LoopHandle) {
        let (tx, rx) = unbounded();
        let handle = LoopHandle {
            tx,
            shared: Arc::new(LoopShared {
                name: name.into(),
                thread: OnceLock::new(),
                quit: AtomicBool::new(false),
                handler: Mutex::new(None),
                routes: Mutex::new(HashMap::new()),
            }),
        };
        (
            Looper {
                rx,
                handle: handle.clone(),
            },
            handle,
        )
    }

    /// Drains events until [`LoopHandle::quit`] is observed. Events still
    /// queued at that point are dropped, which fails any pending callers.
    pub fn run(self) {
        let shared = Arc::clone(&self.handle.shared);
        let _ = shared.thread.set(thread::current().id());
        debug!(target: "node_runtime::looper", loop_name = %shared.name, "run loop started");

        while !shared.quit.load(Ordering::Acquire) {
            let Ok(event) = self.rx.recv() else { break };
            match event {
                LoopEvent::Task(task) => task(),
                LoopEvent::Deliver(Delivery::Call { message, reply }) => {
                    self.dispatch_call(message, reply)
                }
                LoopEvent::Deliver(Delivery::Signal(signal)) => self.dispatch_signal(signal),
                LoopEvent::Quit => break,
            }
        }

        shared.handler.lock().take();
        shared.routes.lock().clear();
        debug!(target: "node_runtime::looper", loop_name = %shared.name, "run loop exited");
    }

    fn dispatch_call(&self, call: Message, reply: ReplySender) {
        let handler = self.handle.shared.handler.lock().clone();
        trace!(loop_name = %self.handle.name(), member = call.member(), "dispatching call");
        let response = match handler {
            Some(handler) => handler.handle_call(call),
            None => {
                warn!(loop_name = %self.handle.name(), member = call.member(), "call with no handler");
                Message::error(&call, error_names::UNKNOWN_METHOD, "no object published")
            }
        };
        reply.send(response);
    }

    fn dispatch_signal(&self, signal: Message) {
        let route = self
            .handle
            .shared
            .routes
            .lock()
            .get(signal.member())
            .cloned();
        match route {
            Some(route) => route.on_signal(signal),
            None => warn!(
                loop_name = %self.handle.name(),
                member = signal.member(),
                "rejected signal with no matching rule"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_post_order_on_loop_thread() {
        let (looper, handle) = Looper::new("order");
        let worker = thread::spawn(move || looper.run());
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            let loop_handle = handle.clone();
            handle
                .post(move || tx.send((i, loop_handle.is_loop_thread())).unwrap())
                .unwrap();
        }
        let seen: Vec<_> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(
            seen,
            (0..8).map(|i| (i, true)).collect::<Vec<_>>()
        );
        assert!(!handle.is_loop_thread());

        handle.quit();
        worker.join().unwrap();
        assert!(matches!(handle.post(|| {}), Err(NodeError::LoopStopped(_))));
    }

    #[test]
    fn call_without_handler_gets_unknown_method() {
        let (looper, handle) = Looper::new("bare");
        let worker = thread::spawn(move || looper.run());
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle
            .deliver(Delivery::Call {
                message: Message::method_call("org.vdev.Bare", "open"),
                reply: ReplySender::new(tx),
            })
            .unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            reply.error_info().map(|(name, _)| name),
            Some(error_names::UNKNOWN_METHOD)
        );
        handle.quit();
        worker.join().unwrap();
    }

    #[test]
    fn quit_from_inside_a_task_stops_the_loop() {
        let (looper, handle) = Looper::new("self-quit");
        let worker = thread::spawn(move || looper.run());
        let inner = handle.clone();
        handle.post(move || inner.quit()).unwrap();
        worker.join().unwrap();
        assert!(!handle.is_running());
    }
}
