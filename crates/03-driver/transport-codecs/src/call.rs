//! Client-side call conventions over the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use device_abi::{
    result_to_status, status, status_to_result, DeviceError, DeviceResult,
};
use log::{debug, warn};
use transport::{Bus, Message, RemoteObject};

use crate::fields::{map_bus_error, DeviceFields};

/// Builds calls for one remote object and sends them with a fixed timeout.
pub struct CallCodec {
    bus: Arc<dyn Bus>,
    remote: RemoteObject,
    timeout: Duration,
    closed: AtomicBool,
}

impl CallCodec {
    pub fn new(bus: Arc<dyn Bus>, remote: RemoteObject, timeout: Duration) -> Self {
        Self {
            bus,
            remote,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Builds a call to `method`, or `None` once the codec has been closed.
    pub fn obtain(&self, method: &str) -> Option<Message> {
        if self.closed.load(Ordering::Acquire) {
            warn!("{}: {method} requested on a closed codec", self.remote.service);
            return None;
        }
        Some(Message::method_call(&self.remote.interface, method))
    }

    /// Stops handing out calls; already built ones can still be sent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Sends `call` and blocks for the reply.
    pub fn send(&self, call: Message) -> DeviceResult<Message> {
        let member = call.member().to_owned();
        self.bus
            .call(&self.remote, call, self.timeout)
            .map_err(|err| {
                warn!("{} {member} failed: {err}", self.remote.service);
                map_bus_error(err)
            })
    }

    /// Sends `call` without waiting for a reply.
    pub fn send_no_reply(&self, call: Message) -> DeviceResult<()> {
        self.bus.send(&self.remote, call).map_err(map_bus_error)
    }

    /// Sends a status-only command and maps the returned status.
    pub fn call_status(&self, call: Message) -> DeviceResult<()> {
        let mut reply = self.send(call)?;
        status_to_result(reply.take_i32()?)
    }

    /// Sends a command with out-parameters. The reply is returned positioned
    /// after the status, and only when the status is success.
    pub fn call_with_results(&self, call: Message) -> DeviceResult<Message> {
        let member = call.member().to_owned();
        let mut reply = self.send(call)?;
        let code = reply.take_i32()?;
        if code != status::OK {
            debug!("{} {member} returned status {code}", self.remote.service);
            return Err(DeviceError::from_status(code));
        }
        Ok(reply)
    }
}

/// Builds a status-only reply.
pub fn reply_status<T>(call: &Message, result: &DeviceResult<T>) -> Message {
    let mut reply = Message::method_return(call);
    reply.append_i32(result_to_status(result));
    reply
}

/// Builds a reply carrying a status and, on success, whatever `fill` appends.
pub fn reply_with<T>(
    call: &Message,
    result: DeviceResult<T>,
    fill: impl FnOnce(&mut Message, T),
) -> Message {
    let mut reply = Message::method_return(call);
    match result {
        Ok(value) => {
            reply.append_i32(status::OK);
            fill(&mut reply, value);
        }
        Err(err) => {
            reply.append_i32(err.status());
        }
    }
    reply
}
