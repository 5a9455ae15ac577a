//! Client half of the directory.
//!
//! Most callers go through the process-wide instance returned by
//! [`DirectoryClient::shared`], connected lazily on first use and dropped
//! with [`DirectoryClient::reset_shared`].

use std::sync::Arc;

use device_abi::{
    directory_methods, BridgeConfig, DeviceError, DeviceResult, NodeId, DIRECTORY_SERVICE,
};
use log::{debug, info};
use node_runtime::{ClientFactory, ClientRole, Node, NodeContext, NodeObject, ServiceNames};
use parking_lot::Mutex;
use transport::Bus;
use transport_codecs::{CallCodec, DeviceFields};

use crate::service::map_node_error;

/// Proxy for the published directory.
pub struct DirectoryProxy {
    codec: CallCodec,
}

impl DirectoryProxy {
    fn obtain(&self, method: &str) -> DeviceResult<transport::Message> {
        self.codec
            .obtain(method)
            .ok_or_else(|| DeviceError::bus("directory connection closed"))
    }

    pub fn create_node(&self) -> DeviceResult<NodeId> {
        let call = self.obtain(directory_methods::CREATE_NODE)?;
        let mut reply = self.codec.send(call)?;
        let id = reply.take_node_id()?;
        if id.is_valid() {
            Ok(id)
        } else {
            Err(DeviceError::exhausted("directory could not allocate a node"))
        }
    }

    pub fn destroy_node(&self, id: NodeId) -> DeviceResult<()> {
        let mut call = self.obtain(directory_methods::DESTROY_NODE)?;
        call.append_i32(id.to_wire());
        self.codec.send_no_reply(call)
    }

    pub fn is_local_node(&self, pid: u32) -> DeviceResult<bool> {
        let mut call = self.obtain(directory_methods::IS_LOCAL_NODE)?;
        call.append_i32(pid as i32);
        self.codec.send(call)?.take_bool()
    }
}

impl NodeObject for DirectoryProxy {
    fn teardown(&self) {
        self.codec.close();
    }
}

type DirectoryClientNode = Node<ClientRole<DirectoryProxy, ClientFactory<DirectoryProxy>>>;

pub struct DirectoryClient {
    node: DirectoryClientNode,
    bus: Arc<dyn Bus>,
}

static SHARED: Mutex<Option<Arc<DirectoryClient>>> = parking_lot::const_mutex(None);

impl DirectoryClient {
    /// Connects a dedicated client node to the directory on `bus`.
    pub fn connect(bus: Arc<dyn Bus>, config: &BridgeConfig) -> DeviceResult<Self> {
        let timeout = config.call_timeout();
        let build: ClientFactory<DirectoryProxy> =
            Box::new(move |ctx: &NodeContext, remote| {
                Ok(Arc::new(DirectoryProxy {
                    codec: CallCodec::new(Arc::clone(ctx.bus()), remote, timeout),
                }))
            });
        let node = Node::new(
            Arc::clone(&bus),
            ServiceNames::new(DIRECTORY_SERVICE, None),
            ClientRole::new(build),
        );
        node.init().map_err(map_node_error)?;
        debug!("directory client connected");
        Ok(Self { node, bus })
    }

    /// The process-wide client, connected on first use over `bus`. Later
    /// calls return the same instance until [`Self::reset_shared`].
    pub fn shared(bus: Arc<dyn Bus>, config: &BridgeConfig) -> DeviceResult<Arc<Self>> {
        let mut shared = SHARED.lock();
        if let Some(client) = shared.as_ref().filter(|c| c.node.node().is_some()) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(Self::connect(bus, config)?);
        info!("shared directory client initialised");
        *shared = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drops the process-wide client. Holders of an `Arc` keep theirs alive.
    pub fn reset_shared() {
        let previous = SHARED.lock().take();
        if previous.is_some() {
            info!("shared directory client released");
        }
    }

    fn proxy(&self) -> DeviceResult<Arc<DirectoryProxy>> {
        self.node
            .node()
            .ok_or_else(|| DeviceError::bus("directory client is not connected"))
    }

    pub fn create_node(&self) -> DeviceResult<NodeId> {
        self.proxy()?.create_node()
    }

    pub fn destroy_node(&self, id: NodeId) -> DeviceResult<()> {
        self.proxy()?.destroy_node(id)
    }

    /// Whether the directory runs in this process.
    pub fn is_local_node(&self) -> DeviceResult<bool> {
        self.proxy()?.is_local_node(self.bus.pid())
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }
}
