//! One client connection to a device: a node id from the directory plus a
//! client node resolving `VideoDevice.<id>`.

use std::sync::Arc;

use device_abi::{BridgeConfig, DeviceError, DeviceResult, Ioctl, NodeId, VideoDevice, DEVICE_SERVICE};
use log::{info, warn};
use node_runtime::{ClientFactory, ClientRole, Node, NodeContext, ServiceNames};
use services_directory::{map_node_error, DirectoryClient};
use transport::Bus;
use transport_codecs::CallCodec;

use crate::proxy::DeviceProxy;

type DeviceClientNode = Node<ClientRole<DeviceProxy, ClientFactory<DeviceProxy>>>;

/// Dropping the session uninitialises its node and asks the directory to
/// destroy the server-side instance.
pub struct VideoDeviceClient {
    id: NodeId,
    node: DeviceClientNode,
    directory: Arc<DirectoryClient>,
}

impl VideoDeviceClient {
    /// Connects through the process-wide directory client.
    pub fn connect(bus: Arc<dyn Bus>, config: &BridgeConfig) -> DeviceResult<Self> {
        let directory = DirectoryClient::shared(Arc::clone(&bus), config)?;
        Self::connect_via(directory, bus, config)
    }

    pub fn connect_via(
        directory: Arc<DirectoryClient>,
        bus: Arc<dyn Bus>,
        config: &BridgeConfig,
    ) -> DeviceResult<Self> {
        let id = directory.create_node()?;
        let timeout = config.call_timeout();
        let shm_dir = config.shm_dir.clone();
        let build: ClientFactory<DeviceProxy> = Box::new(move |ctx: &NodeContext, remote| {
            let codec = CallCodec::new(Arc::clone(ctx.bus()), remote, timeout);
            Ok(Arc::new(DeviceProxy::new(id, codec, shm_dir.clone())))
        });
        let node = Node::new(
            bus,
            ServiceNames::new(DEVICE_SERVICE, Some(id.0)),
            ClientRole::new(build),
        );
        if let Err(err) = node.init() {
            if let Err(destroy) = directory.destroy_node(id) {
                warn!("{id}: destroy after failed connect: {destroy}");
            }
            return Err(map_node_error(err));
        }
        info!("{id}: client connected");
        Ok(Self {
            id,
            node,
            directory,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn device(&self) -> DeviceResult<Arc<DeviceProxy>> {
        self.node
            .node()
            .ok_or_else(|| DeviceError::bus(format!("{} is disconnected", self.id)))
    }
}

impl VideoDevice for VideoDeviceClient {
    fn open(&self, name: &str, flags: i32) -> bool {
        self.device().is_ok_and(|dev| dev.open(name, flags))
    }

    fn close(&self) -> bool {
        self.device().is_ok_and(|dev| dev.close())
    }

    fn ioctl(&self, cmd: &mut Ioctl) -> DeviceResult<()> {
        self.device()?.ioctl(cmd)
    }

    fn poll(&self, poll_device: bool) -> DeviceResult<bool> {
        self.device()?.poll(poll_device)
    }

    fn set_device_poll_interrupt(&self) -> DeviceResult<()> {
        self.device()?.set_device_poll_interrupt()
    }

    fn clear_device_poll_interrupt(&self) -> DeviceResult<()> {
        self.device()?.clear_device_poll_interrupt()
    }

    fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        offset: u32,
    ) -> DeviceResult<usize> {
        self.device()?.mmap(addr, length, prot, flags, offset)
    }

    fn munmap(&self, addr: usize, length: usize) -> DeviceResult<()> {
        self.device()?.munmap(addr, length)
    }

    fn set_parameter(&self, key: &str, value: &str) -> DeviceResult<()> {
        self.device()?.set_parameter(key, value)
    }
}

impl Drop for VideoDeviceClient {
    fn drop(&mut self) {
        self.node.uninit();
        if let Err(err) = self.directory.destroy_node(self.id) {
            warn!("{}: destroyNode failed: {err}", self.id);
        }
    }
}
