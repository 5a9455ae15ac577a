//! Server-side adaptor: decodes device calls, drives the instance and
//! re-encodes results. It binds to the first caller and watches it; when
//! that caller disconnects, the node's buffers are released and the
//! directory is asked to remove the node.

use std::sync::{Arc, Weak};

use device_abi::{device_methods, DeviceError, DeviceResult, Port, VideoDevice};
use log::{debug, info, warn};
use node_runtime::{CallHandler, NodeContext, NodeObject, NodeResult, SignalRelay};
use parking_lot::Mutex;
use services_directory::DirectoryHandle;
use transport::{error_names, Bus, ConnectionId, Message, WatchId};
use transport_codecs::{
    append_ioctl_result, map_bus_error, read_ioctl, reply_status, reply_with, DeviceFields,
};

use crate::instance::DeviceInstance;
use crate::segments::{BufferKey, SegmentToken};

struct PeerWatch {
    peer: ConnectionId,
    watch: WatchId,
}

pub struct DeviceAdaptor {
    instance: Arc<DeviceInstance>,
    bus: Arc<dyn Bus>,
    relay: SignalRelay,
    peer: Mutex<Option<PeerWatch>>,
    me: Weak<DeviceAdaptor>,
}

impl DeviceAdaptor {
    /// Builds the adaptor on the node thread and registers its death relay.
    pub fn create(
        ctx: &NodeContext,
        instance: Arc<DeviceInstance>,
        directory: DirectoryHandle,
    ) -> NodeResult<Arc<Self>> {
        let on_death = {
            let instance = Arc::clone(&instance);
            move |_signal: Message| {
                let released = instance.release_all();
                info!("{}: client gone, {released} buffer(s) released", instance.id());
                directory.request_removal(instance.id());
            }
        };
        let relay = SignalRelay::register(
            Arc::clone(ctx.bus()),
            ctx.handle().clone(),
            ctx.names(),
            on_death,
        )?;
        Ok(Arc::new_cyclic(|me| Self {
            instance,
            bus: Arc::clone(ctx.bus()),
            relay,
            peer: Mutex::new(None),
            me: me.clone(),
        }))
    }

    pub fn instance(&self) -> &Arc<DeviceInstance> {
        &self.instance
    }

    /// Checks the embedded node id and binds the node to its first caller.
    fn admit(&self, call: &mut Message) -> DeviceResult<()> {
        let caller = call.take_node_id()?;
        self.instance.check_id(caller)?;
        let Some(sender) = call.sender() else {
            return Ok(());
        };
        let mut peer = self.peer.lock();
        match peer.as_ref() {
            Some(bound) if bound.peer == sender => Ok(()),
            Some(bound) => Err(DeviceError::protocol(format!(
                "{} is bound to {}, not {sender}",
                self.instance.id(),
                bound.peer
            ))),
            None => {
                let me = self.me.clone();
                let watch = self
                    .bus
                    .watch_peer(
                        sender,
                        Box::new(move |dead| {
                            if let Some(adaptor) = me.upgrade() {
                                adaptor.on_peer_death(dead);
                            }
                        }),
                    )
                    .map_err(map_bus_error)?;
                debug!("{} bound to {sender}", self.instance.id());
                *peer = Some(PeerWatch {
                    peer: sender,
                    watch,
                });
                Ok(())
            }
        }
    }

    /// Runs on the bus notifier thread; the cleanup itself runs on the node thread.
    fn on_peer_death(&self, dead: ConnectionId) {
        info!("{}: peer {dead} disconnected", self.instance.id());
        self.peer.lock().take();
        let mut signal = self.relay.new_signal();
        signal.append_i32(self.instance.id().to_wire());
        if let Err(err) = self.relay.send_msg(signal) {
            warn!("{}: death cleanup not delivered: {err}", self.instance.id());
        }
    }

    fn dispatch(&self, member: &str, call: &mut Message) -> Message {
        let instance = &self.instance;
        match member {
            device_methods::OPEN => {
                let result = call
                    .take_str()
                    .and_then(|name| Ok((name, call.take_i32()?)))
                    .and_then(|(name, flags)| instance.open_device(&name, flags));
                reply_status(call, &result)
            }
            device_methods::CLOSE => reply_status(call, &instance.close_device()),
            device_methods::IOCTL => {
                let result = read_ioctl(call).and_then(|mut cmd| {
                    instance.ioctl_bridged(&mut cmd)?;
                    Ok(cmd)
                });
                reply_with(call, result, |reply, cmd| append_ioctl_result(reply, &cmd))
            }
            device_methods::POLL => {
                let result = call.take_bool().and_then(|poll_device| instance.poll(poll_device));
                reply_with(call, result, |reply, pending| {
                    reply.append_bool(pending);
                })
            }
            device_methods::SET_POLL_INTERRUPT => {
                reply_status(call, &instance.set_device_poll_interrupt())
            }
            device_methods::CLEAR_POLL_INTERRUPT => {
                reply_status(call, &instance.clear_device_poll_interrupt())
            }
            device_methods::MMAP => {
                let result = self.mmap(call);
                reply_with(call, result, |reply, addr| {
                    reply.append_i64(addr as i64);
                })
            }
            device_methods::MUNMAP => {
                let result = call
                    .take_i64()
                    .and_then(|magic| {
                        call.take_i64()?;
                        instance.unmap_segment(magic as usize)
                    });
                reply_status(call, &result)
            }
            device_methods::SET_PARAMETER => {
                let result = call
                    .take_str()
                    .and_then(|key| Ok((key, call.take_str()?)))
                    .and_then(|(key, value)| instance.set_parameter(&key, &value));
                reply_status(call, &result)
            }
            other => Message::error(
                call,
                error_names::UNKNOWN_METHOD,
                &format!("device has no method {other}"),
            ),
        }
    }

    /// `addr:i64, length:i64, prot:i32, flags:i32, offset:i32, port:i32,
    /// index:i32, plane:i32, token:i64, size:i32`. The segment name is rebuilt
    /// from the token, so a client can only name files in the segment directory.
    fn mmap(&self, call: &mut Message) -> DeviceResult<usize> {
        let _client_addr = call.take_i64()?;
        let length = call.take_i64()? as usize;
        let prot = call.take_i32()?;
        let flags = call.take_i32()?;
        let offset = call.take_i32()? as u32;
        let port = Port::from_raw(call.take_i32()?)?;
        let index = call.take_i32()? as u32;
        let plane = call.take_i32()? as u32;
        let token = SegmentToken(call.take_i64()? as u64);
        let size = call.take_i32()? as usize;
        if size < length {
            return Err(DeviceError::protocol(format!(
                "segment {} of {size} bytes cannot back {length}",
                token.segment_name()
            )));
        }
        self.instance.map_segment(
            BufferKey::new(port, index, plane),
            token,
            length,
            prot,
            flags,
            offset,
        )
    }
}

impl CallHandler for DeviceAdaptor {
    fn handle_call(&self, mut call: Message) -> Message {
        let member = call.member().to_owned();
        if let Err(err) = self.admit(&mut call) {
            warn!("{}: {member} rejected: {err}", self.instance.id());
            return reply_status::<()>(&call, &Err(err));
        }
        debug!("{}: {member}", self.instance.id());
        self.dispatch(&member, &mut call)
    }
}

impl NodeObject for DeviceAdaptor {
    fn teardown(&self) {
        if let Some(bound) = self.peer.lock().take() {
            self.bus.unwatch_peer(bound.watch);
        }
        self.instance.shutdown();
    }
}
