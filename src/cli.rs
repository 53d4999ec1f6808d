use std::net::SocketAddr;

use clap::Parser;

/// Run the message bus broker, forwarding published messages to subscribers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the broker should bind to. Use 0.0.0.0 to accept LAN
    /// connections, or port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5001")]
    pub listen: SocketAddr,
}
