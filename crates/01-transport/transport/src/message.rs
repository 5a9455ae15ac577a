//! Positional typed messages carried by the bus.
//!
//! Fields are never named. Both ends of a method agree on field order by
//! construction, so a [`Message`] is an ordered list of [`Value`]s plus a
//! read cursor that advances with every typed read.

use crate::bus::ConnectionId;
use crate::error::{TransportError, TransportResult};

/// Error names attached to error replies.
pub mod error_names {
    /// The caller is not allowed to talk to the destination.
    pub const ACCESS_DENIED: &str = "org.vdev.Error.AccessDenied";
    /// No reply arrived before the timeout, or the destination vanished.
    pub const NO_REPLY: &str = "org.vdev.Error.NoReply";
    /// The destination service is not registered.
    pub const SERVICE_UNKNOWN: &str = "org.vdev.Error.ServiceUnknown";
    /// The destination has no handler for the call.
    pub const UNKNOWN_METHOD: &str = "org.vdev.Error.UnknownMethod";
    /// Generic failure.
    pub const FAILED: &str = "org.vdev.Error.Failed";
}

/// One typed positional field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// A raw pointer value. Only meaningful inside the process that produced it.
    Ptr(u64),
    /// A file descriptor number.
    Fd(i32),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Ptr(_) => "pointer",
            Value::Fd(_) => "fd",
        }
    }
}

/// Message category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// A call, reply, error, or signal with positional fields.
#[derive(Clone, Debug)]
pub struct Message {
    kind: MessageKind,
    interface: String,
    member: String,
    sender: Option<ConnectionId>,
    error_name: Option<String>,
    fields: Vec<Value>,
    cursor: usize,
}

macro_rules! typed_read {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        /// Reads the next field, failing when it has a different type.
        pub fn $name(&mut self) -> TransportResult<$ty> {
            let index = self.cursor;
            match self.next_field($label)? {
                Value::$variant(v) => Ok(v.clone()),
                other => Err(TransportError::FieldType {
                    index,
                    expected: $label,
                    found: other.type_name(),
                }),
            }
        }
    };
}

impl Message {
    fn new(kind: MessageKind, interface: &str, member: &str) -> Self {
        Self {
            kind,
            interface: interface.to_owned(),
            member: member.to_owned(),
            sender: None,
            error_name: None,
            fields: Vec::new(),
            cursor: 0,
        }
    }

    /// Builds a method call on `interface`.
    pub fn method_call(interface: &str, member: &str) -> Self {
        Self::new(MessageKind::MethodCall, interface, member)
    }

    /// Builds a signal named `member`.
    pub fn signal(interface: &str, member: &str) -> Self {
        Self::new(MessageKind::Signal, interface, member)
    }

    /// Builds the successful reply to `call`.
    pub fn method_return(call: &Message) -> Self {
        Self::new(MessageKind::MethodReturn, &call.interface, &call.member)
    }

    /// Builds an error reply to `call`.
    pub fn error(call: &Message, name: &str, text: &str) -> Self {
        let mut msg = Self::new(MessageKind::Error, &call.interface, &call.member);
        msg.error_name = Some(name.to_owned());
        msg.fields.push(Value::Str(text.to_owned()));
        msg
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Connection that sent the message, stamped by the bus.
    pub fn sender(&self) -> Option<ConnectionId> {
        self.sender
    }

    pub fn set_sender(&mut self, sender: ConnectionId) {
        self.sender = Some(sender);
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// Error name and text for [`MessageKind::Error`] messages.
    pub fn error_info(&self) -> Option<(&str, &str)> {
        let name = self.error_name.as_deref()?;
        let text = match self.fields.first() {
            Some(Value::Str(text)) => text.as_str(),
            _ => "",
        };
        Some((name, text))
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Moves the read cursor back to the first field.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Number of fields not yet read.
    pub fn remaining(&self) -> usize {
        self.fields.len().saturating_sub(self.cursor)
    }

    pub fn append(&mut self, value: Value) -> &mut Self {
        self.fields.push(value);
        self
    }

    pub fn append_bool(&mut self, v: bool) -> &mut Self {
        self.append(Value::Bool(v))
    }

    pub fn append_i32(&mut self, v: i32) -> &mut Self {
        self.append(Value::I32(v))
    }

    pub fn append_i64(&mut self, v: i64) -> &mut Self {
        self.append(Value::I64(v))
    }

    pub fn append_str(&mut self, v: &str) -> &mut Self {
        self.append(Value::Str(v.to_owned()))
    }

    pub fn append_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.append(Value::Bytes(v.to_vec()))
    }

    pub fn append_ptr(&mut self, v: u64) -> &mut Self {
        self.append(Value::Ptr(v))
    }

    pub fn append_fd(&mut self, v: i32) -> &mut Self {
        self.append(Value::Fd(v))
    }

    typed_read!(read_bool, Bool, bool, "bool");
    typed_read!(read_i32, I32, i32, "int32");
    typed_read!(read_i64, I64, i64, "int64");
    typed_read!(read_str, Str, String, "string");
    typed_read!(read_bytes, Bytes, Vec<u8>, "bytes");
    typed_read!(read_ptr, Ptr, u64, "pointer");
    typed_read!(read_fd, Fd, i32, "fd");

    fn next_field(&mut self, expected: &'static str) -> TransportResult<&Value> {
        let index = self.cursor;
        let value = self
            .fields
            .get(index)
            .ok_or(TransportError::MissingField { index, expected })?;
        self.cursor += 1;
        Ok(value)
    }
}
