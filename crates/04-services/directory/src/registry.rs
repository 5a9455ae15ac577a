//! Live device nodes owned by the directory.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use device_abi::{DeviceError, DeviceResult, NodeId};
use log::{debug, info, warn};
use node_runtime::LoopHandle;
use parking_lot::Mutex;

use crate::allocator::SharedAllocator;

/// A node constructed by a [`NodeFactory`]. Dropping it tears the node down.
pub trait HostedNode: Send {
    fn node_id(&self) -> NodeId;
}

/// Builds the server-side instance for a freshly allocated id.
pub trait NodeFactory: Send + Sync {
    fn construct(&self, id: NodeId, directory: DirectoryHandle)
        -> DeviceResult<Box<dyn HostedNode>>;
}

/// Non-owning handle an instance uses to ask for its own removal.
///
/// Removal always runs as a task on the directory's thread, so it is safe
/// to request from the instance's thread or from a bus notifier.
#[derive(Clone)]
pub struct DirectoryHandle {
    registry: Weak<DirectoryRegistry>,
    handle: LoopHandle,
}

impl DirectoryHandle {
    pub fn request_removal(&self, id: NodeId) {
        let registry = self.registry.clone();
        let posted = self.handle.post(move || {
            if let Some(registry) = registry.upgrade() {
                registry.destroy_node(id);
            }
        });
        if let Err(err) = posted {
            warn!("cannot queue removal of {id}: {err}");
        }
    }
}

pub struct DirectoryRegistry {
    allocator: SharedAllocator,
    factory: Arc<dyn NodeFactory>,
    handle: LoopHandle,
    nodes: Mutex<HashMap<NodeId, Box<dyn HostedNode>>>,
}

impl DirectoryRegistry {
    /// `handle` is the loop that removal requests are posted to.
    pub fn new(
        allocator: SharedAllocator,
        factory: Arc<dyn NodeFactory>,
        handle: LoopHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            factory,
            handle,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn create_node(self: &Arc<Self>) -> DeviceResult<NodeId> {
        let id = self.allocator.lock().allocate();
        if !id.is_valid() {
            return Err(DeviceError::exhausted("node id space exhausted"));
        }
        let directory = DirectoryHandle {
            registry: Arc::downgrade(self),
            handle: self.handle.clone(),
        };
        let node = self.factory.construct(id, directory)?;
        self.nodes.lock().insert(id, node);
        info!("created {id}");
        Ok(id)
    }

    /// Removes and tears down `id`. Returns whether it was present.
    pub fn destroy_node(&self, id: NodeId) -> bool {
        let node = self.nodes.lock().remove(&id);
        match node {
            Some(node) => {
                drop(node);
                info!("destroyed {id}");
                true
            }
            None => {
                debug!("destroy for unknown {id}");
                false
            }
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Tears down every node.
    pub fn clear(&self) {
        let nodes: Vec<Box<dyn HostedNode>> =
            self.nodes.lock().drain().map(|(_, node)| node).collect();
        if !nodes.is_empty() {
            debug!("tearing down {} node(s)", nodes.len());
        }
        drop(nodes);
    }
}
