use std::{
    collections::HashMap,
    error::Error,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, mpsc},
};

use clap::Parser;
use log::{debug, info, warn};

use cachewire::{
    Acceptor, AcceptorConfig, Channel, ChannelError, ChannelEventListener, Message, MessageType,
    protocol::ServerIdentity,
};

#[derive(Debug, Parser)]
#[command(version, about = "Demo broker speaking the cachewire protocol", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:7000")]
    address: SocketAddr,
    /// PEM certificate chain; enables TLS together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Idle time in milliseconds before a silent connection is dropped
    #[arg(long, default_value_t = 240_000)]
    socket_timeout: u64,
}

struct Entry {
    data: Vec<u8>,
    expire_time: i64,
}

/// Keeps entries announced by workers and answers fetches from them.
#[derive(Default)]
struct Broker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Broker {
    fn handle(&self, message: &Message) -> Message {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let client = message.client_id();

        match message.kind() {
            MessageType::FetchEntry => {
                let key = message.key().unwrap_or_default();
                match entries.get(key) {
                    Some(entry) => {
                        Message::put_entry("broker", key, entry.data.clone(), entry.expire_time)
                    }
                    None => {
                        debug!("{client} missed {key}");
                        Message::ack("broker")
                    }
                }
            }
            MessageType::PutEntry => {
                if let (Some(key), Some(data)) = (message.key(), message.data()) {
                    let entry = Entry {
                        data: data.to_vec(),
                        expire_time: message.expire_time().unwrap_or_default(),
                    };
                    entries.insert(key.to_string(), entry);
                }
                Message::ack("broker")
            }
            MessageType::Invalidate | MessageType::UnregisterEntry => {
                if let Some(key) = message.key() {
                    entries.remove(key);
                }
                Message::ack("broker")
            }
            MessageType::InvalidateByPrefix => {
                let prefix = message.prefix().unwrap_or_default();
                entries.retain(|key, _| !key.starts_with(prefix));
                Message::ack("broker")
            }
            MessageType::ClientConnectionRequest | MessageType::ClientShutdown => {
                info!("{} from {client}", message.kind());
                Message::ack("broker")
            }
            other => Message::error(
                "broker",
                &ChannelError::from(std::io::Error::other(format!("unsupported request {other}"))),
            ),
        }
    }
}

impl ChannelEventListener for Broker {
    fn message_received(&self, channel: &Channel, message: Message) {
        let reply = self.handle(&message);
        if let Err(e) = channel.send_reply_message(&message, reply) {
            warn!("failed to answer {message}: {e}");
        }
    }

    fn channel_closed(&self, channel: &Channel) {
        info!("{channel} disconnected");
    }

    fn exception_caught(&self, channel: &Channel, error: &ChannelError) {
        warn!("{channel} dropped: {error}");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = AcceptorConfig::new(cli.address).with_socket_timeout_millis(cli.socket_timeout);
    if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
        config = config.with_identity(ServerIdentity::from_pem_files(cert, key)?);
    }

    let mut acceptor = Acceptor::bind(config, Arc::new(Broker::default()))?;
    acceptor.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    info!("shutting down");
    acceptor.close();
    Ok(())
}
