//! Node lifecycle: one worker thread per connection, with construction and
//! destruction of the published or resolved object confined to it.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};
use transport::{Bus, Registration, RemoteObject};

use crate::error::{NodeError, NodeResult};
use crate::looper::{CallHandler, LoopHandle, Looper};
use crate::names::ServiceNames;

/// What a role's `create` step can see.
#[derive(Clone)]
pub struct NodeContext {
    bus: Arc<dyn Bus>,
    names: ServiceNames,
    handle: LoopHandle,
}

impl NodeContext {
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn names(&self) -> &ServiceNames {
        &self.names
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

/// Object owned by a node. `teardown` runs on the node thread before the
/// node drops its reference.
pub trait NodeObject: Send + Sync + 'static {
    fn teardown(&self) {}
}

/// The bus operation a node performs on its thread during create/destroy.
pub trait NodeRole: Send + 'static {
    type Object: NodeObject;

    fn create(&mut self, ctx: &NodeContext) -> NodeResult<Arc<Self::Object>>;

    fn destroy(&mut self, ctx: &NodeContext, object: Arc<Self::Object>);
}

/// Boxed create step for a [`ServerRole`].
pub type ServerFactory<O> = Box<dyn FnMut(&NodeContext) -> NodeResult<Arc<O>> + Send>;

/// Boxed create step for a [`ClientRole`].
pub type ClientFactory<O> =
    Box<dyn FnMut(&NodeContext, RemoteObject) -> NodeResult<Arc<O>> + Send>;

/// Publishes an object as a named service; the object answers calls.
pub struct ServerRole<O, F> {
    factory: F,
    registration: Option<Registration>,
    _object: PhantomData<fn() -> O>,
}

impl<O, F> ServerRole<O, F>
where
    O: NodeObject + CallHandler,
    F: FnMut(&NodeContext) -> NodeResult<Arc<O>> + Send + 'static,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            registration: None,
            _object: PhantomData,
        }
    }
}

impl<O, F> NodeRole for ServerRole<O, F>
where
    O: NodeObject + CallHandler,
    F: FnMut(&NodeContext) -> NodeResult<Arc<O>> + Send + 'static,
{
    type Object = O;

    fn create(&mut self, ctx: &NodeContext) -> NodeResult<Arc<O>> {
        let object = (self.factory)(ctx)?;
        ctx.handle.set_call_handler(object.clone());
        let names = &ctx.names;
        match ctx.bus.request_name(
            names.service(),
            names.path(),
            names.interface(),
            Arc::new(ctx.handle.clone()),
        ) {
            Ok(registration) => {
                debug!(service = names.service(), "published service");
                self.registration = Some(registration);
                Ok(object)
            }
            Err(err) => {
                ctx.handle.clear_call_handler();
                object.teardown();
                Err(NodeError::Registration(err))
            }
        }
    }

    fn destroy(&mut self, ctx: &NodeContext, object: Arc<O>) {
        if let Some(registration) = self.registration.take() {
            ctx.bus.release_name(&registration);
        }
        ctx.handle.clear_call_handler();
        object.teardown();
    }
}

/// Resolves a named service and builds a proxy for it.
pub struct ClientRole<O, F> {
    factory: F,
    _object: PhantomData<fn() -> O>,
}

impl<O, F> ClientRole<O, F>
where
    O: NodeObject,
    F: FnMut(&NodeContext, RemoteObject) -> NodeResult<Arc<O>> + Send + 'static,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            _object: PhantomData,
        }
    }
}

impl<O, F> NodeRole for ClientRole<O, F>
where
    O: NodeObject,
    F: FnMut(&NodeContext, RemoteObject) -> NodeResult<Arc<O>> + Send + 'static,
{
    type Object = O;

    fn create(&mut self, ctx: &NodeContext) -> NodeResult<Arc<O>> {
        let remote = ctx
            .bus
            .lookup(ctx.names.service())
            .map_err(NodeError::Lookup)?;
        debug!(service = %remote.service, owner = %remote.owner, "resolved service");
        (self.factory)(ctx, remote)
    }

    fn destroy(&mut self, _ctx: &NodeContext, object: Arc<O>) {
        object.teardown();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Creating,
    Ready,
    Failed,
    Destroying,
    Destroyed,
}

struct NodeState<O> {
    phase: Phase,
    object: Option<Arc<O>>,
    error: Option<NodeError>,
}

struct NodeInner<R: NodeRole> {
    ctx: NodeContext,
    role: Mutex<R>,
    state: Mutex<NodeState<R::Object>>,
    cond: Condvar,
}

impl<R: NodeRole> NodeInner<R> {
    /// A panicking create step counts as a failed one, so `init` always wakes.
    fn run_create(&self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.role.lock().create(&self.ctx)))
            .unwrap_or_else(|payload| Err(NodeError::create(panic_message(payload.as_ref()))));
        let mut state = self.state.lock();
        match result {
            Ok(object) => {
                state.object = Some(object);
                state.phase = Phase::Ready;
            }
            Err(err) => {
                state.error = Some(err);
                state.phase = Phase::Failed;
            }
        }
        self.cond.notify_all();
    }

    fn run_destroy(&self) {
        let object = self.state.lock().object.take();
        if let Some(object) = object {
            self.role.lock().destroy(&self.ctx, object);
        }
        self.state.lock().phase = Phase::Destroyed;
        self.cond.notify_all();
    }

    fn wait_while(&self, phase: Phase) -> Phase {
        let mut state = self.state.lock();
        while state.phase == phase {
            self.cond.wait(&mut state);
        }
        state.phase
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    format!("create step panicked: {detail}")
}

/// A connection endpoint owning one worker thread.
///
/// `init` blocks until the role's create step has run on the worker thread;
/// `uninit` blocks until destroy has run and the thread has been joined,
/// unless it is called from the worker thread itself.
pub struct Node<R: NodeRole> {
    inner: Arc<NodeInner<R>>,
    looper: Mutex<Option<Looper>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<R: NodeRole> Node<R> {
    pub fn new(bus: Arc<dyn Bus>, names: ServiceNames, role: R) -> Self {
        let (looper, handle) = Looper::new(names.thread_name());
        Self {
            inner: Arc::new(NodeInner {
                ctx: NodeContext { bus, names, handle },
                role: Mutex::new(role),
                state: Mutex::new(NodeState {
                    phase: Phase::Idle,
                    object: None,
                    error: None,
                }),
                cond: Condvar::new(),
            }),
            looper: Mutex::new(Some(looper)),
            thread: Mutex::new(None),
        }
    }

    pub fn init(&self) -> NodeResult<()> {
        let looper = self
            .looper
            .lock()
            .take()
            .ok_or(NodeError::AlreadyInitialized)?;
        let handle = self.inner.ctx.handle.clone();
        let thread = thread::Builder::new()
            .name(handle.name().to_owned())
            .spawn(move || looper.run())
            .map_err(|err| {
                error!(node = handle.name(), "worker thread failed to start: {err}");
                NodeError::ThreadSpawn(err)
            })?;

        self.inner.state.lock().phase = Phase::Creating;
        let inner = Arc::clone(&self.inner);
        if let Err(err) = handle.post(move || inner.run_create()) {
            self.inner.state.lock().phase = Phase::Failed;
            handle.quit();
            let _ = thread.join();
            return Err(err);
        }

        match self.inner.wait_while(Phase::Creating) {
            Phase::Ready => {
                *self.thread.lock() = Some(thread);
                debug!(node = handle.name(), "node initialized");
                Ok(())
            }
            _ => {
                handle.quit();
                if thread.join().is_err() {
                    warn!(node = handle.name(), "worker thread panicked during init");
                }
                let err = self
                    .inner
                    .state
                    .lock()
                    .error
                    .take()
                    .unwrap_or_else(|| NodeError::create("create task did not complete"));
                warn!(node = handle.name(), "node init failed: {err}");
                Err(err)
            }
        }
    }

    pub fn uninit(&self) {
        let handle = &self.inner.ctx.handle;
        {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Ready => state.phase = Phase::Destroying,
                Phase::Destroying if !handle.is_loop_thread() => {
                    drop(state);
                    self.inner.wait_while(Phase::Destroying);
                    return;
                }
                _ => return,
            }
        }

        if handle.is_loop_thread() {
            self.inner.run_destroy();
            handle.quit();
            // The thread exits once the current event returns; it cannot join itself.
            self.thread.lock().take();
            debug!(node = handle.name(), "node torn down from its own thread");
            return;
        }

        let inner = Arc::clone(&self.inner);
        if handle.post(move || inner.run_destroy()).is_err() {
            warn!(node = handle.name(), "loop already stopped; destroying on caller thread");
            self.inner.run_destroy();
        }
        self.inner.wait_while(Phase::Destroying);
        handle.quit();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(node = handle.name(), "worker thread panicked");
            }
        }
        debug!(node = handle.name(), "node uninitialized");
    }

    /// The published or resolved object; `None` before `init` succeeds or after `uninit`.
    pub fn node(&self) -> Option<Arc<R::Object>> {
        let state = self.inner.state.lock();
        match state.phase {
            Phase::Ready => state.object.clone(),
            _ => None,
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.inner.ctx.handle
    }

    pub fn names(&self) -> &ServiceNames {
        &self.inner.ctx.names
    }

    /// Whether a worker thread is attached to this node.
    pub fn has_thread(&self) -> bool {
        self.thread.lock().is_some()
    }
}

impl<R: NodeRole> Drop for Node<R> {
    fn drop(&mut self) {
        self.uninit();
    }
}
