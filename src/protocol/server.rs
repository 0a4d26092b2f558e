use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use rustls::{ServerConfig, ServerConnection};

use crate::config::AcceptorConfig;

use super::{
    ChannelError,
    channel::{Channel, ChannelEventListener},
    codec::FrameCodec,
    connector::set_timeouts,
    error::TlsError,
    handler::InboundHandler,
    thread::ThreadPool,
    tls,
    transport::Wire,
};

/// Broker-side end of the protocol: accepts worker connections and binds each one to
/// a [`Channel`] reporting to the shared listener.
pub struct Acceptor {
    local_addr: SocketAddr,
    socket: Option<TcpListener>,
    shared: Arc<Shared>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    listener: Arc<dyn ChannelEventListener>,
    tls: Option<Arc<ServerConfig>>,
    codec: FrameCodec,
    socket_timeout: Duration,
    pool: Arc<ThreadPool>,
    channels: Mutex<Vec<Channel>>,
    stopped: AtomicBool,
}

impl Shared {
    fn channels(&self) -> MutexGuard<'_, Vec<Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Acceptor {
    /// Binds the listening socket. Connections are not accepted until [`start`](Self::start).
    pub fn bind(
        config: AcceptorConfig,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Result<Self, ChannelError> {
        let tls = config
            .identity
            .as_ref()
            .map(tls::server_config)
            .transpose()
            .map_err(ChannelError::from)?;

        let socket = TcpListener::bind(config.address)
            .map_err(|e| ChannelError::connect(config.address.to_string(), e))?;
        let local_addr = socket.local_addr()?;

        let shared = Shared {
            listener,
            tls,
            codec: FrameCodec::new(config.max_frame_length),
            socket_timeout: config.socket_timeout,
            pool: Arc::new(ThreadPool::new(
                "cachewire-broker-callbacks",
                config.callback_threads.max(1),
            )?),
            channels: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        Ok(Self {
            local_addr,
            socket: Some(socket),
            shared: Arc::new(shared),
            accept_thread: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live channels, one per connected peer.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = self.shared.channels();
        channels.retain(Channel::is_valid);
        channels.clone()
    }

    /// Starts accepting connections on a background thread.
    pub fn start(&mut self) -> io::Result<()> {
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        info!(
            "listening at {} ({})",
            self.local_addr,
            if self.shared.tls.is_some() { "tls" } else { "plain" }
        );

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("cachewire-acceptor".into())
            .spawn(move || accept_loop(socket, shared))?;
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stops accepting and closes every channel. Safe to call more than once.
    pub fn close(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket.take();

        if let Some(handle) = self.accept_thread.take() {
            // Wake the blocking accept so it observes the stop flag.
            if let Err(e) = TcpStream::connect(wake_address(self.local_addr)) {
                debug!("failed to wake acceptor: {e}");
            }
            if handle.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }

        let channels: Vec<Channel> = self.shared.channels().drain(..).collect();
        for channel in channels {
            channel.close();
        }
        info!("acceptor at {} closed", self.local_addr);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, addr.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, addr.port()).into(),
        _ => addr,
    }
}

fn accept_loop(socket: TcpListener, shared: Arc<Shared>) {
    for stream in socket.incoming() {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".into());
                let shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("cachewire-conn-{peer}"))
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &peer, &shared) {
                            warn!("connection from {peer} failed to establish: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("failed to spawn connection thread: {e}");
                }
            }
            Err(e) => warn!("broken connection: {e:?}"),
        }
    }
    debug!("accept loop stopped");
}

/// Finishes the handshake, registers the channel and runs its read loop on the
/// current thread.
fn handle_connection(stream: TcpStream, peer: &str, shared: &Shared) -> Result<(), ChannelError> {
    stream.set_nodelay(true)?;
    set_timeouts(&stream, shared.socket_timeout)?;

    let wire = match &shared.tls {
        None => Wire::Plain(stream),
        Some(config) => {
            let session = ServerConnection::new(Arc::clone(config)).map_err(TlsError::from)?;
            Wire::tls(session.into(), stream).map_err(|e| ChannelError::connect(peer, e))?
        }
    };
    let (reader, writer, control) = wire.split()?;

    let channel = Channel::open(
        peer,
        shared.codec,
        Arc::clone(&shared.listener),
        Arc::clone(&shared.pool),
        writer,
        Some(control),
    )?;

    {
        let mut channels = shared.channels();
        if shared.stopped.load(Ordering::SeqCst) {
            drop(channels);
            channel.close();
            return Ok(());
        }
        channels.retain(Channel::is_valid);
        channels.push(channel.clone());
    }
    info!("accepted connection from {peer}");

    InboundHandler::new(channel, reader, shared.codec).run();
    Ok(())
}
