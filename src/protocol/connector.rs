use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use rustls::ClientConnection;

use crate::config::ConnectorConfig;

use super::{
    ChannelError,
    channel::{Channel, ChannelEventListener},
    codec::FrameCodec,
    error::TlsError,
    handler::InboundHandler,
    thread::ThreadPool,
    tls,
    transport::Wire,
};

/// Worker-side end of the protocol: opens the connection to the broker and owns the
/// resulting [`Channel`].
pub struct Connector {
    config: ConnectorConfig,
    listener: Arc<dyn ChannelEventListener>,
    connection: Option<Connection>,
}

struct Connection {
    channel: Channel,
    socket: TcpStream,
    reader: Option<thread::JoinHandle<()>>,
    pool: Arc<ThreadPool>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, listener: Arc<dyn ChannelEventListener>) -> Self {
        Self {
            config,
            listener,
            connection: None,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// The channel produced by the last successful [`connect`](Self::connect).
    pub fn channel(&self) -> Option<&Channel> {
        self.connection.as_ref().map(|c| &c.channel)
    }

    /// Connects to the configured broker. The returned channel is live: TCP is
    /// established, TLS (if enabled) has completed its handshake and the read loop is
    /// running. Failures are reported as they happen; there is no retry.
    ///
    /// If a previous channel is still valid it is returned instead of reconnecting.
    pub fn connect(&mut self) -> Result<Channel, ChannelError> {
        if let Some(connection) = &self.connection {
            if connection.channel.is_valid() {
                return Ok(connection.channel.clone());
            }
        }
        if let Err(e) = self.close() {
            debug!("previous connection cleanup failed: {e}");
        }

        let address = self.config.address();
        let tls = match (self.config.ssl, &self.config.trust_policy) {
            (false, _) => None,
            (true, Some(policy)) => Some(tls::client_config(policy)?),
            (true, None) => return Err(TlsError::MissingTrustPolicy.into()),
        };

        let tcp = open_socket(&address, self.config.connect_timeout)?;
        let peer = tcp
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| address.clone());
        tcp.set_nodelay(true)
            .map_err(|e| ChannelError::connect(&address, e))?;
        set_timeouts(&tcp, self.config.connect_timeout)
            .map_err(|e| ChannelError::connect(&address, e))?;

        let wire = match tls {
            None => Wire::Plain(tcp),
            Some(tls_config) => {
                let name = tls::server_name(&self.config.host)?;
                let session = ClientConnection::new(tls_config, name).map_err(TlsError::from)?;
                Wire::tls(session.into(), tcp).map_err(|e| ChannelError::connect(&address, e))?
            }
        };

        set_timeouts(wire.tcp(), self.config.socket_timeout)?;
        let socket = wire.tcp().try_clone()?;
        let (reader, writer, control) = wire.split()?;

        let codec = FrameCodec::new(self.config.max_frame_length);
        let pool = Arc::new(ThreadPool::new(
            "cachewire-callbacks",
            self.config.callback_threads.max(1),
        )?);
        let channel = Channel::open(
            peer,
            codec,
            Arc::clone(&self.listener),
            Arc::clone(&pool),
            writer,
            Some(control),
        )?;
        let reader = InboundHandler::new(channel.clone(), reader, codec).spawn()?;

        info!(
            "connected to {address} ({})",
            if self.config.ssl { "tls" } else { "plain" }
        );
        self.connection = Some(Connection {
            channel: channel.clone(),
            socket,
            reader: Some(reader),
            pool,
        });
        Ok(channel)
    }

    /// Closes the channel, then the socket, then stops the read loop and drops the
    /// callback pool. Every step runs; the first failure is returned. Safe to call
    /// more than once.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };
        let mut first_error = None;

        connection.channel.close();

        if let Err(e) = connection.socket.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                first_error.get_or_insert(ChannelError::from(e));
            }
        }

        if let Some(reader) = connection.reader.take() {
            // close() may be called from the listener, i.e. on the read loop itself.
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                warn!("read loop of {} panicked", connection.channel);
                first_error.get_or_insert(ChannelError::from(io::Error::other(
                    "read loop panicked",
                )));
            }
        }
        drop(connection.pool);

        debug!("connector for {} closed", self.config.address());
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close connector: {e}");
        }
    }
}

fn open_socket(address: &str, timeout: Duration) -> Result<TcpStream, ChannelError> {
    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|e| ChannelError::connect(address, e))?
        .collect();

    let mut last_error =
        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
    for addr in addrs {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_error = e;
            }
        }
    }
    Err(ChannelError::connect(address, last_error))
}

/// Zero means no timeout.
pub(crate) fn set_timeouts(tcp: &TcpStream, timeout: Duration) -> io::Result<()> {
    let timeout = (!timeout.is_zero()).then_some(timeout);
    tcp.set_read_timeout(timeout)?;
    tcp.set_write_timeout(timeout)
}
