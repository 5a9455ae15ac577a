//! Server half of the directory: a published node answering
//! `createNode`, `destroyNode` and `isLocalNode`.

use std::sync::Arc;

use device_abi::{directory_methods, DeviceError, DeviceResult, NodeId, DIRECTORY_SERVICE};
use log::{debug, warn};
use node_runtime::{
    CallHandler, Node, NodeContext, NodeError, NodeObject, ServerFactory, ServerRole,
    ServiceNames,
};
use transport::{error_names, Bus, Message};
use transport_codecs::DeviceFields;

use crate::allocator::SharedAllocator;
use crate::registry::{DirectoryRegistry, NodeFactory};

/// Maps a node lifecycle failure onto the device taxonomy.
pub fn map_node_error(err: NodeError) -> DeviceError {
    match err {
        NodeError::ThreadSpawn(_) | NodeError::Registration(_) => {
            DeviceError::exhausted(err.to_string())
        }
        NodeError::Lookup(bus) => transport_codecs::map_bus_error(bus),
        other => DeviceError::bus(other.to_string()),
    }
}

/// Published directory object.
pub struct DirectoryService {
    registry: Arc<DirectoryRegistry>,
    pid: u32,
}

impl DirectoryService {
    pub fn registry(&self) -> &Arc<DirectoryRegistry> {
        &self.registry
    }

    fn create_node(&self) -> NodeId {
        match self.registry.create_node() {
            Ok(id) => id,
            Err(err) => {
                warn!("createNode failed: {err}");
                NodeId::INVALID
            }
        }
    }

    fn handle(&self, call: &mut Message) -> DeviceResult<Message> {
        let mut reply = Message::method_return(call);
        let member = call.member().to_owned();
        match member.as_str() {
            directory_methods::CREATE_NODE => {
                reply.append_i32(self.create_node().to_wire());
            }
            directory_methods::DESTROY_NODE => {
                let id = call.take_node_id()?;
                if !self.registry.destroy_node(id) {
                    return Err(DeviceError::protocol(format!("{id} is not registered")));
                }
            }
            directory_methods::IS_LOCAL_NODE => {
                let pid = call.take_i32()? as u32;
                reply.append_bool(pid == self.pid);
            }
            other => {
                return Ok(Message::error(
                    call,
                    error_names::UNKNOWN_METHOD,
                    &format!("directory has no method {other}"),
                ))
            }
        }
        Ok(reply)
    }
}

impl CallHandler for DirectoryService {
    fn handle_call(&self, mut call: Message) -> Message {
        debug!("directory call {}", call.member());
        match self.handle(&mut call) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("directory {} rejected: {err}", call.member());
                Message::error(&call, error_names::FAILED, &err.to_string())
            }
        }
    }
}

impl NodeObject for DirectoryService {
    fn teardown(&self) {
        self.registry.clear();
    }
}

pub type DirectoryNode = Node<ServerRole<DirectoryService, ServerFactory<DirectoryService>>>;

/// Running directory server.
pub struct DirectoryServer {
    node: DirectoryNode,
}

impl DirectoryServer {
    /// Publishes the directory on `bus`. Ids come from `allocator`;
    /// instances are built by `factory`.
    pub fn start(
        bus: Arc<dyn Bus>,
        allocator: SharedAllocator,
        factory: Arc<dyn NodeFactory>,
    ) -> DeviceResult<Self> {
        let build: ServerFactory<DirectoryService> = Box::new(move |ctx: &NodeContext| {
            Ok(Arc::new(DirectoryService {
                registry: DirectoryRegistry::new(
                    Arc::clone(&allocator),
                    Arc::clone(&factory),
                    ctx.handle().clone(),
                ),
                pid: ctx.bus().pid(),
            }))
        });
        let node = Node::new(
            bus,
            ServiceNames::new(DIRECTORY_SERVICE, None),
            ServerRole::new(build),
        );
        node.init().map_err(map_node_error)?;
        Ok(Self { node })
    }

    /// The live registry; `None` once stopped.
    pub fn registry(&self) -> Option<Arc<DirectoryRegistry>> {
        self.node.node().map(|svc| Arc::clone(svc.registry()))
    }

    /// Unpublishes the directory and tears down every node it hosts.
    pub fn stop(&self) {
        self.node.uninit();
    }
}
