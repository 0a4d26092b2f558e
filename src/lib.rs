pub mod config;
pub mod message;
pub mod protocol;

pub use config::{AcceptorConfig, ConnectorConfig};
pub use message::{Message, MessageType, Value};
pub use protocol::{Acceptor, Channel, ChannelError, ChannelEventListener, Connector};
