use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};

use cachewire::{
    Channel, Connector, ConnectorConfig, Message,
    protocol::TrustPolicy,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Request {
    Connect,
    Fetch,
    Put,
    Invalidate,
    InvalidatePrefix,
    Unregister,
}

#[derive(Parser)]
#[command(version, about = "Send one message to a cachewire broker and print the reply", long_about = None)]
struct Cli {
    /// Kind of message to send
    #[arg(value_enum)]
    request: Request,
    /// Entry key, or prefix for invalidate-prefix
    #[arg(default_value = "")]
    key: String,
    /// Entry value for put
    #[arg(long, default_value = "")]
    value: String,
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long, default_value_t = 7000)]
    port: u16,
    #[arg(long, default_value = "cachewire-cli")]
    client_id: String,
    /// Secret presented with a connection request
    #[arg(long, default_value = "")]
    secret: String,
    /// Trust only certificates issued by this PEM CA; enables TLS
    #[arg(long, conflicts_with = "insecure")]
    ca: Option<PathBuf>,
    /// Use TLS without verifying the broker's certificate
    #[arg(long)]
    insecure: bool,
    /// Milliseconds to wait for the reply
    #[arg(long, default_value_t = 5_000)]
    timeout: u64,
}

impl Cli {
    fn message(&self) -> Message {
        let client = self.client_id.as_str();
        let key = self.key.as_str();
        match self.request {
            Request::Connect => Message::client_connection_request(client, &self.secret),
            Request::Fetch => Message::fetch_entry(client, key),
            Request::Put => Message::put_entry(client, key, self.value.clone().into_bytes(), 0),
            Request::Invalidate => Message::invalidate(client, key),
            Request::InvalidatePrefix => Message::invalidate_by_prefix(client, key),
            Request::Unregister => Message::unregister_entry(client, key),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ConnectorConfig::new(&cli.host, cli.port);
    if let Some(ca) = &cli.ca {
        config = config.with_tls(TrustPolicy::pinned_ca_file(ca)?);
    } else if cli.insecure {
        config = config.with_tls(TrustPolicy::Insecure);
    }

    let listener = Arc::new(|_: &Channel, message: Message| println!("<< {message}"));
    let mut connector = Connector::new(config, listener);
    let channel = connector.connect()?;

    let message = cli.message();
    println!(">> {message}");
    let reply = channel.send_message_with_reply(message, Duration::from_millis(cli.timeout))?;
    println!("<< {reply}");

    connector.close()?;
    Ok(())
}
