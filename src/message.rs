//! Protocol messages exchanged between cache workers and the broker.
//!
//! A [`Message`] is a typed envelope: it names the client it belongs to, carries a
//! [`MessageType`] tag, a pair of correlation identifiers and a bag of parameters.
//! The parameters are loosely typed on the wire ([`Value`]) but every known message
//! type publishes the keys it expects through [`MessageType::schema`].
//!
//! # Overview
//!
//! Messages are built with one factory per type, which populate exactly the
//! parameters that type requires:
//!
//! ```rust
//! use cachewire::{Message, MessageType};
//!
//! let msg = Message::put_entry("clientA", "k1", vec![1, 2, 3], 1_700_000_000);
//! assert_eq!(msg.kind(), MessageType::PutEntry);
//! assert_eq!(msg.key(), Some("k1"));
//! assert_eq!(msg.data(), Some(&[1u8, 2, 3][..]));
//! assert_eq!(msg.expire_time(), Some(1_700_000_000));
//! assert!(msg.message_id().is_none());
//! ```
//!
//! Identifiers are attached by the [`Channel`](crate::protocol::Channel) at send time;
//! application code only touches them when answering a request.
//!
//! # See Also
//!
//! - [`codec`](crate::protocol::codec): Binary layout of a message on the wire.
use std::{collections::BTreeMap, error::Error, fmt};

pub mod params {
    pub const KEY: &str = "key";
    pub const DATA: &str = "data";
    pub const EXPIRE_TIME: &str = "expiretime";
    pub const PREFIX: &str = "prefix";
    pub const SECRET: &str = "secret";
    pub const ERROR: &str = "error";
    pub const STACK_TRACE: &str = "stackTrace";
}

/// Message type tag. The set of known types is closed; anything else read off the
/// wire is kept as [`MessageType::Unknown`] so it can be reported, but the codec
/// refuses to carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ack,
    ClientConnectionRequest,
    ClientShutdown,
    Invalidate,
    Error,
    PutEntry,
    InvalidateByPrefix,
    UnregisterEntry,
    FetchEntry,
    Unknown(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bytes,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ValueKind,
}

const fn spec(name: &'static str, kind: ValueKind) -> ParamSpec {
    ParamSpec { name, kind }
}

const KEY_ONLY: &[ParamSpec] = &[spec(params::KEY, ValueKind::String)];
const PREFIX_ONLY: &[ParamSpec] = &[spec(params::PREFIX, ValueKind::String)];
const SECRET_ONLY: &[ParamSpec] = &[spec(params::SECRET, ValueKind::String)];
const PUT_ENTRY: &[ParamSpec] = &[
    spec(params::KEY, ValueKind::String),
    spec(params::DATA, ValueKind::Bytes),
    spec(params::EXPIRE_TIME, ValueKind::Long),
];
const ERROR: &[ParamSpec] = &[
    spec(params::ERROR, ValueKind::String),
    spec(params::STACK_TRACE, ValueKind::String),
];

impl MessageType {
    pub fn code(self) -> i32 {
        match self {
            MessageType::Ack => 1,
            MessageType::ClientConnectionRequest => 2,
            MessageType::ClientShutdown => 3,
            MessageType::Invalidate => 4,
            MessageType::Error => 5,
            MessageType::PutEntry => 6,
            MessageType::InvalidateByPrefix => 7,
            MessageType::UnregisterEntry => 8,
            MessageType::FetchEntry => 9,
            MessageType::Unknown(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MessageType::Ack,
            2 => MessageType::ClientConnectionRequest,
            3 => MessageType::ClientShutdown,
            4 => MessageType::Invalidate,
            5 => MessageType::Error,
            6 => MessageType::PutEntry,
            7 => MessageType::InvalidateByPrefix,
            8 => MessageType::UnregisterEntry,
            9 => MessageType::FetchEntry,
            code => MessageType::Unknown(code),
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }

    /// Parameters every message of this type carries.
    pub fn schema(self) -> &'static [ParamSpec] {
        match self {
            MessageType::ClientConnectionRequest => SECRET_ONLY,
            MessageType::Invalidate | MessageType::UnregisterEntry | MessageType::FetchEntry => {
                KEY_ONLY
            }
            MessageType::InvalidateByPrefix => PREFIX_ONLY,
            MessageType::PutEntry => PUT_ENTRY,
            MessageType::Error => ERROR,
            MessageType::Ack | MessageType::ClientShutdown | MessageType::Unknown(_) => &[],
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Ack => "ACK",
            MessageType::ClientConnectionRequest => "CLIENT_CONNECTION_REQUEST",
            MessageType::ClientShutdown => "CLIENT_SHUTDOWN",
            MessageType::Invalidate => "INVALIDATE",
            MessageType::Error => "ERROR",
            MessageType::PutEntry => "PUT_ENTRY",
            MessageType::InvalidateByPrefix => "INVALIDATE_BY_PREFIX",
            MessageType::UnregisterEntry => "UNREGISTER_ENTRY",
            MessageType::FetchEntry => "FETCH_ENTRY",
            MessageType::Unknown(code) => return write!(f, "?{code}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Bytes(Vec<u8>),
    Long(i64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Long(_) => ValueKind::Long,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            Value::Long(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    client_id: String,
    kind: MessageType,
    parameters: BTreeMap<String, Value>,
    message_id: Option<String>,
    reply_message_id: Option<String>,
}

impl Message {
    pub fn new(
        client_id: impl Into<String>,
        kind: MessageType,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
            parameters,
            message_id: None,
            reply_message_id: None,
        }
    }

    fn with_params<const N: usize>(
        client_id: impl Into<String>,
        kind: MessageType,
        params: [(&str, Value); N],
    ) -> Self {
        let parameters = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self::new(client_id, kind, parameters)
    }

    pub fn ack(client_id: impl Into<String>) -> Self {
        Self::with_params(client_id, MessageType::Ack, [])
    }

    pub fn fetch_entry(client_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::with_params(
            client_id,
            MessageType::FetchEntry,
            [(params::KEY, Value::String(key.into()))],
        )
    }

    pub fn put_entry(
        client_id: impl Into<String>,
        key: impl Into<String>,
        data: Vec<u8>,
        expire_time: i64,
    ) -> Self {
        Self::with_params(
            client_id,
            MessageType::PutEntry,
            [
                (params::KEY, Value::String(key.into())),
                (params::DATA, Value::Bytes(data)),
                (params::EXPIRE_TIME, Value::Long(expire_time)),
            ],
        )
    }

    pub fn unregister_entry(client_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::with_params(
            client_id,
            MessageType::UnregisterEntry,
            [(params::KEY, Value::String(key.into()))],
        )
    }

    /// Builds an `ERROR` message. The description is the error's `Display` output and
    /// the trace lists every error in its `source()` chain, outermost first.
    pub fn error(client_id: impl Into<String>, error: &dyn Error) -> Self {
        let mut trace = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::with_params(
            client_id,
            MessageType::Error,
            [
                (params::ERROR, Value::String(error.to_string())),
                (params::STACK_TRACE, Value::String(trace)),
            ],
        )
    }

    pub fn client_connection_request(
        client_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self::with_params(
            client_id,
            MessageType::ClientConnectionRequest,
            [(params::SECRET, Value::String(secret.into()))],
        )
    }

    pub fn client_shutdown(client_id: impl Into<String>) -> Self {
        Self::with_params(client_id, MessageType::ClientShutdown, [])
    }

    pub fn invalidate(client_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::with_params(
            client_id,
            MessageType::Invalidate,
            [(params::KEY, Value::String(key.into()))],
        )
    }

    pub fn invalidate_by_prefix(client_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::with_params(
            client_id,
            MessageType::InvalidateByPrefix,
            [(params::PREFIX, Value::String(prefix.into()))],
        )
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn reply_message_id(&self) -> Option<&str> {
        self.reply_message_id.as_deref()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_message_id.is_some()
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn set_reply_message_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.reply_message_id = Some(id.into());
        self
    }

    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_parameter(key, value);
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.parameter(params::KEY).and_then(Value::as_str)
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.parameter(params::DATA).and_then(Value::as_bytes)
    }

    pub fn expire_time(&self) -> Option<i64> {
        self.parameter(params::EXPIRE_TIME).and_then(Value::as_long)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.parameter(params::PREFIX).and_then(Value::as_str)
    }

    pub fn secret(&self) -> Option<&str> {
        self.parameter(params::SECRET).and_then(Value::as_str)
    }

    pub fn error_description(&self) -> Option<&str> {
        self.parameter(params::ERROR).and_then(Value::as_str)
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.parameter(params::STACK_TRACE).and_then(Value::as_str)
    }

    /// True when every parameter the type's schema names is present with the
    /// expected kind. Extra keys are allowed.
    pub fn conforms_to_schema(&self) -> bool {
        self.kind.schema().iter().all(|spec| {
            self.parameters
                .get(spec.name)
                .is_some_and(|v| v.kind() == spec.kind)
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, parameters={{", self.kind)?;
        for (i, (k, v)) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}, id={}", self.message_id.as_deref().unwrap_or("-"))?;
        if let Some(reply) = &self.reply_message_id {
            write!(f, ", replyMessageId={reply}")?;
        }
        Ok(())
    }
}
