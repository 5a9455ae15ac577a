//! Hosting device nodes: the directory's node factory and a server that
//! publishes the directory with it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use device_abi::{BridgeConfig, DeviceResult, NodeId, DEVICE_SERVICE};
use log::debug;
use node_runtime::{Node, NodeContext, ServerFactory, ServerRole, ServiceNames};
use parking_lot::Mutex;
use services_directory::{
    global_allocator, map_node_error, DirectoryHandle, DirectoryRegistry, DirectoryServer,
    HostedNode, NodeFactory, SharedAllocator,
};
use transport::Bus;

use crate::adaptor::DeviceAdaptor;
use crate::backend::BackendRegistry;
use crate::instance::DeviceInstance;

type DeviceServerNode = Node<ServerRole<DeviceAdaptor, ServerFactory<DeviceAdaptor>>>;

/// A published device node. Dropping it unpublishes the node and closes the device.
struct DeviceNode {
    id: NodeId,
    _node: DeviceServerNode,
}

impl HostedNode for DeviceNode {
    fn node_id(&self) -> NodeId {
        self.id
    }
}

/// Builds a [`DeviceInstance`] and publishes it as `VideoDevice.<id>`.
pub struct DeviceFactory {
    bus: Arc<dyn Bus>,
    backends: Arc<BackendRegistry>,
    config: BridgeConfig,
    instances: Mutex<HashMap<NodeId, Weak<DeviceInstance>>>,
}

impl DeviceFactory {
    pub fn new(bus: Arc<dyn Bus>, backends: Arc<BackendRegistry>, config: BridgeConfig) -> Self {
        Self {
            bus,
            backends,
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The live instance for `id`, for in-process callers.
    pub fn instance(&self, id: NodeId) -> Option<Arc<DeviceInstance>> {
        self.instances.lock().get(&id).and_then(Weak::upgrade)
    }
}

impl NodeFactory for DeviceFactory {
    fn construct(&self, id: NodeId, directory: DirectoryHandle) -> DeviceResult<Box<dyn HostedNode>> {
        let instance = Arc::new(DeviceInstance::new(
            id,
            Arc::clone(&self.backends),
            &self.config,
        ));
        let build: ServerFactory<DeviceAdaptor> = {
            let instance = Arc::clone(&instance);
            Box::new(move |ctx: &NodeContext| {
                DeviceAdaptor::create(ctx, Arc::clone(&instance), directory.clone())
            })
        };
        let node = Node::new(
            Arc::clone(&self.bus),
            ServiceNames::new(DEVICE_SERVICE, Some(id.0)),
            ServerRole::new(build),
        );
        node.init().map_err(map_node_error)?;

        let mut instances = self.instances.lock();
        instances.retain(|_, weak| weak.strong_count() > 0);
        instances.insert(id, Arc::downgrade(&instance));
        debug!("{id} published");
        Ok(Box::new(DeviceNode { id, _node: node }))
    }
}

/// The directory plus the device factory behind it.
pub struct DeviceServer {
    directory: DirectoryServer,
    factory: Arc<DeviceFactory>,
}

impl DeviceServer {
    /// Publishes the directory on `bus`, allocating from the process-wide allocator.
    pub fn start(
        bus: Arc<dyn Bus>,
        backends: Arc<BackendRegistry>,
        config: BridgeConfig,
    ) -> DeviceResult<Self> {
        Self::start_with_allocator(bus, backends, config, global_allocator())
    }

    pub fn start_with_allocator(
        bus: Arc<dyn Bus>,
        backends: Arc<BackendRegistry>,
        config: BridgeConfig,
        allocator: SharedAllocator,
    ) -> DeviceResult<Self> {
        let factory = Arc::new(DeviceFactory::new(Arc::clone(&bus), backends, config));
        let directory = DirectoryServer::start(bus, allocator, factory.clone())?;
        Ok(Self { directory, factory })
    }

    pub fn registry(&self) -> Option<Arc<DirectoryRegistry>> {
        self.directory.registry()
    }

    pub fn instance(&self, id: NodeId) -> Option<Arc<DeviceInstance>> {
        self.factory.instance(id)
    }

    /// Unpublishes the directory and every device node.
    pub fn stop(&self) {
        self.directory.stop();
    }
}
