use std::{
    collections::{HashMap, HashSet},
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, ToSocketAddrs, tcp::OwnedWriteHalf},
    select,
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::message;

type ConnId = u64;

/// How long a fresh connection may take to declare its subscriptions before
/// the broker drops it.
const HANDSHAKE_WINDOW: Duration = Duration::from_secs(10);

/// Frames queued per subscriber before it counts as too slow. Overflowing the
/// queue disconnects that subscriber so the rest of the bus keeps flowing.
const OUTBOUND_QUEUE: usize = 64;

/// The central routing process: accepts client connections, records their
/// declared subscriptions, and fans every published frame out to the current
/// subscribers of its channel.
///
/// The broker can run standalone (see `main.rs`) or embedded in any process
/// by spawning [`Broker::run`] on a background task; a client in the same
/// process connects to it like any other.
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
        }
    }

    /// Binds the listening socket. Bind failure is the only fatal startup
    /// error; it surfaces here so embedders and `main` can report it.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            // One task per connection so a stalled client never blocks new accepts.
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, state).await {
                                    debug!(peer = %peer, error = ?err, "client connection closed with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(error = ?err, "failed to accept connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct BrokerState {
    table: Mutex<RoutingTable>,
    next_id: AtomicU64,
}

/// Channel-to-subscriber routing table. Channel entries appear lazily when a
/// subscription arrives and vanish with their last subscriber.
#[derive(Default)]
struct RoutingTable {
    channels: HashMap<String, HashSet<ConnId>>,
    conns: HashMap<ConnId, mpsc::Sender<Vec<u8>>>,
}

impl RoutingTable {
    fn remove(&mut self, id: ConnId) {
        self.conns.remove(&id);
        self.channels.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }
}

impl BrokerState {
    fn new() -> Self {
        Self {
            table: Mutex::new(RoutingTable::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn register(&self, id: ConnId, channels: &[String], outbound: mpsc::Sender<Vec<u8>>) {
        let mut table = self.table.lock().await;
        table.conns.insert(id, outbound);
        for channel in channels {
            table.channels.entry(channel.clone()).or_default().insert(id);
        }
    }

    async fn deregister(&self, id: ConnId) {
        self.table.lock().await.remove(id);
    }

    /// Queues the frame body to every subscriber of the channel. A frame for
    /// a channel without subscribers is dropped without error. Subscribers
    /// whose queue is full or closed are de-registered on the spot.
    async fn publish(&self, channel: &str, body: &[u8]) {
        let mut table = self.table.lock().await;
        let Some(subscribers) = table.channels.get(channel) else {
            return;
        };

        let mut dead = Vec::new();
        for &id in subscribers {
            let Some(outbound) = table.conns.get(&id) else {
                continue;
            };
            match outbound.try_send(body.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(id, channel, "dropping subscriber that cannot keep up");
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            table.remove(id);
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // The first frame must declare the connection's subscriptions.
    let declaration = match timeout(HANDSHAKE_WINDOW, message::read_message(&mut reader)).await {
        Ok(Ok(Some(declaration))) => declaration,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => {
            debug!(?peer, %err, "dropping connection with a malformed handshake");
            return Ok(());
        }
        Err(_) => {
            debug!(?peer, "dropping connection that never declared subscriptions");
            return Ok(());
        }
    };

    let Some(channels) = declaration.subscription_channels() else {
        debug!(?peer, "dropping connection whose first frame is not a valid declaration");
        return Ok(());
    };

    let id = state.next_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    state.register(id, &channels, outbound_tx).await;
    info!(?peer, id, subscriptions = ?channels, "client connected");

    let mut outbound = tokio::spawn(write_outbound(writer, outbound_rx));

    let result = loop {
        select! {
            inbound = message::read_frame(&mut reader) => match inbound {
                Ok(Some(body)) => {
                    let published = match message::decode(&body) {
                        Ok(published) => published,
                        Err(err) => break Err(err.into()),
                    };
                    if published.is_subscription() {
                        break Err(anyhow!("published on the reserved subscription channel"));
                    }
                    state.publish(published.channel(), &body).await;
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err.into()),
            },
            // The outbound task ending means the peer's socket failed or the
            // connection was de-registered as too slow.
            _ = &mut outbound => break Ok(()),
        }
    };

    state.deregister(id).await;
    info!(?peer, id, "client disconnected");
    result
}

/// Drains a subscriber's queue onto its socket. Exits when the queue closes
/// (the connection was de-registered) or a write fails.
async fn write_outbound(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(body) = queue.recv().await {
        if let Err(err) = message::write_frame(&mut writer, &body).await {
            debug!(%err, "subscriber write failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &str) -> Vec<u8> {
        body.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_channel() {
        let state = BrokerState::new();
        let (tx_a, mut rx_a) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx_b, mut rx_b) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx_c, mut rx_c) = mpsc::channel(OUTBOUND_QUEUE);

        state.register(1, &["x".to_string()], tx_a).await;
        state.register(2, &["x".to_string()], tx_b).await;
        state.register(3, &["y".to_string()], tx_c).await;

        state.publish("x", &frame(r#"["x", "hi"]"#)).await;

        assert_eq!(rx_a.recv().await.unwrap(), frame(r#"["x", "hi"]"#));
        assert_eq!(rx_b.recv().await.unwrap(), frame(r#"["x", "hi"]"#));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let state = BrokerState::new();
        state.publish("nobody", &frame(r#"["nobody", 1]"#)).await;
    }

    #[tokio::test]
    async fn deregistered_connections_receive_nothing() {
        let state = BrokerState::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);

        state.register(1, &["a".to_string(), "b".to_string()], tx).await;
        state.deregister(1).await;

        state.publish("a", &frame(r#"["a", 1]"#)).await;
        state.publish("b", &frame(r#"["b", 2]"#)).await;
        assert!(rx.try_recv().is_err());

        let table = state.table.lock().await;
        assert!(table.channels.is_empty());
        assert!(table.conns.is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_on_queue_overflow() {
        let state = BrokerState::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        state.register(1, &["k".to_string()], tx).await;

        // Never drain the queue; the publish that overflows it evicts the
        // subscriber from the whole table.
        for _ in 0..=OUTBOUND_QUEUE {
            state.publish("k", &frame(r#"["k", 0]"#)).await;
        }

        let table = state.table.lock().await;
        assert!(table.conns.is_empty());
        assert!(table.channels.is_empty());
    }

    #[tokio::test]
    async fn duplicate_declarations_register_once() {
        let state = BrokerState::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        state
            .register(1, &["k".to_string(), "k".to_string()], tx)
            .await;

        state.publish("k", &frame(r#"["k", 1]"#)).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
