use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

/// Failures of the frame codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {length} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    #[error("unknown parameter tag {tag} for key '{key}'")]
    UnknownValueTag { key: String, tag: u8 },

    #[error("trailing bytes after message payload")]
    TrailingBytes,

    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
}

/// Failures while building a TLS context.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS requested but no trust policy was configured")]
    MissingTrustPolicy,

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("failed to load PEM material: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Errors surfaced by a [`Channel`](super::Channel) and the components producing it.
///
/// Cloneable so that one transport failure can be handed to every pending reply.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("failed to connect to {address}: {cause}")]
    Connect {
        address: String,
        cause: Arc<io::Error>,
    },

    #[error("TLS setup failed: {0}")]
    Tls(Arc<TlsError>),

    #[error("malformed frame: {0}")]
    MalformedFrame(Arc<CodecError>),

    #[error("message could not be encoded: {0}")]
    Encode(Arc<CodecError>),

    #[error("channel closed")]
    Closed,

    #[error("no reply received within {0:?}")]
    Timeout(Duration),

    #[error("transport I/O error: {0}")]
    Transport(Arc<io::Error>),
}

impl ChannelError {
    pub(crate) fn connect(address: impl Into<String>, cause: io::Error) -> Self {
        ChannelError::Connect {
            address: address.into(),
            cause: Arc::new(cause),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(value: io::Error) -> Self {
        ChannelError::Transport(Arc::new(value))
    }
}

impl From<TlsError> for ChannelError {
    fn from(value: TlsError) -> Self {
        ChannelError::Tls(Arc::new(value))
    }
}

/// Decoding errors invalidate the connection, so they convert to `MalformedFrame`.
impl From<CodecError> for ChannelError {
    fn from(value: CodecError) -> Self {
        ChannelError::MalformedFrame(Arc::new(value))
    }
}
