//! Worker/broker communication protocol.
//!
//! This module carries [`Message`](crate::message::Message)s between cache workers and
//! their broker over TCP, optionally wrapped in TLS. It provides the wire codec, the
//! [`Channel`] with its request/reply correlation, and the two ends that produce
//! channels: the worker-side [`Connector`] and the broker-side [`Acceptor`].
//!
//! # Overview
//!
//! Every connection is driven by two threads. A read loop decodes frames in wire order
//! and hands each message to the channel, which either resolves the pending request it
//! answers or passes it to the [`ChannelEventListener`]. A writer thread drains the
//! channel's outbound queue, so frames from concurrent senders never interleave.
//! Reply callbacks run on a separate pool and may send on the channel they were
//! called from.
//!
//! # Binary Format
//!
//! - Each frame starts with a 4-byte big-endian payload length.
//! - The payload holds the client id, the message type code, the message id, an
//!   optional reply id and the parameter map.
//! - Parameter values are tagged as string, bytes or 64-bit integer, so keys unknown
//!   to the receiver are decoded and kept rather than rejected.
//! - All integers are big-endian and fixed width.
//!
//! Frames longer than the configured maximum are rejected from the length prefix alone.
//!
//! # Failure
//!
//! A malformed frame or an I/O failure invalidates the whole channel: every pending
//! request fails with the cause and the listener is told once. Closing a channel fails
//! pending requests with [`ChannelError::Closed`].
mod channel;
pub mod codec;
mod connector;
mod error;
mod handler;
mod server;
mod thread;
pub mod tls;
mod transport;

pub use channel::{Channel, ChannelEventListener};
pub use codec::{FrameCodec, FrameDecoder};
pub use connector::Connector;
pub use error::{ChannelError, CodecError, TlsError};
pub use server::Acceptor;
pub use tls::{ServerIdentity, TrustPolicy};
pub use transport::FramedReader;
