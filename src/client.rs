use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, Notify, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::debug;

use crate::message::{self, EncodeError, Message, SUBSCRIBE_CHANNEL};

/// Broker endpoint used when none is given.
pub const DEFAULT_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5001);

/// Delay between dial attempts while the broker is unreachable.
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid subscription channel {0:?}")]
    InvalidChannel(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("client is closed")]
    Closed,
}

/// A connection to the broker, embedded in a user process.
///
/// The subscription set is declared once at construction and re-declared
/// verbatim on every reconnect. [`send`](Client::send) and
/// [`receive`](Client::receive) block until they succeed and never surface
/// transport errors: a failed connection is re-established under the hood.
/// Both may be called concurrently from different tasks; concurrent sends
/// serialize their frame writes, concurrent receives partition the incoming
/// stream.
pub struct Client {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

struct Shared {
    addr: SocketAddr,
    subscriptions: Vec<String>,
    /// Write half of the current connection; `None` while reconnecting.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Bumped after every successful (re)connection so blocked senders retry.
    generation: watch::Sender<u64>,
    /// Lets the send path tell the reader task the transport is dead.
    reset: Notify,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
}

impl Client {
    /// Connects to the default broker endpoint, subscribing to the given
    /// channels. Blocks until the connection is established and declared;
    /// a refused connection is retried indefinitely.
    pub async fn connect<I, S>(subscriptions: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::connect_to(DEFAULT_ADDR, subscriptions).await
    }

    /// Connects to a specific broker endpoint.
    pub async fn connect_to<I, S>(addr: SocketAddr, subscriptions: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subscriptions: Vec<String> = subscriptions.into_iter().map(Into::into).collect();
        for name in &subscriptions {
            if name.is_empty() || name == SUBSCRIBE_CHANNEL {
                return Err(ClientError::InvalidChannel(name.clone()));
            }
        }

        let (read_half, write_half) = dial(addr, &subscriptions).await;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            addr,
            subscriptions,
            writer: Mutex::new(Some(write_half)),
            generation,
            reset: Notify::new(),
            inbound: Mutex::new(inbound_rx),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_inbound(Arc::clone(&shared), read_half, inbound_tx));

        Ok(Self { shared, reader })
    }

    /// Writes one message to the broker. Blocks until a live transport has
    /// accepted the frame, reconnecting as often as needed; only encode
    /// errors and [`ClientError::Closed`] surface to the caller.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let body = message::encode(message)?;
        let mut generation = self.shared.generation.subscribe();

        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ClientError::Closed);
            }
            generation.borrow_and_update();
            {
                let mut writer = self.shared.writer.lock().await;
                if let Some(stream) = writer.as_mut() {
                    match message::write_frame(stream, &body).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            debug!(%err, "transport failed while sending, reconnecting");
                            writer.take();
                            self.shared.reset.notify_one();
                        }
                    }
                }
            }
            if generation.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    /// Returns the next message addressed to any subscribed channel, in the
    /// order the broker delivered them. Blocks until one is available;
    /// returns [`ClientError::Closed`] only after teardown.
    pub async fn receive(&self) -> Result<Message, ClientError> {
        let mut inbound = self.shared.inbound.lock().await;
        inbound.recv().await.ok_or(ClientError::Closed)
    }

    /// Tears the client down: closes the transport and wakes any blocked
    /// `send` or `receive` with [`ClientError::Closed`]. Messages already
    /// queued locally are still drained by `receive` first.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.shared.writer.lock().await.take();
        self.shared.generation.send_modify(|generation| *generation += 1);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Dials the broker until it accepts, then declares the subscription set.
/// Never gives up; the caller decides how long to wait.
async fn dial(addr: SocketAddr, subscriptions: &[String]) -> (OwnedReadHalf, OwnedWriteHalf) {
    loop {
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%addr, %err, "broker not reachable, retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let (read_half, mut write_half) = stream.into_split();
        let declaration = Message::subscription(subscriptions);
        if let Err(err) = message::write_message(&mut write_half, &declaration).await {
            debug!(%addr, %err, "connection lost while declaring subscriptions, retrying");
            sleep(RECONNECT_DELAY).await;
            continue;
        }
        return (read_half, write_half);
    }
}

/// Owns the read half: decodes incoming frames into the inbound queue and
/// re-establishes the connection whenever the transport dies.
async fn read_inbound(
    shared: Arc<Shared>,
    read_half: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Message>,
) {
    let mut reader = BufReader::new(read_half);
    loop {
        select! {
            received = message::read_message(&mut reader) => match received {
                Ok(Some(received)) => {
                    if inbound.send(received).is_err() {
                        return;
                    }
                    continue;
                }
                Ok(None) => debug!("broker closed the connection"),
                Err(err) => debug!(%err, "transport failed while reading"),
            },
            _ = shared.reset.notified() => {
                // A stale wakeup can arrive after the connection was already
                // replaced; only a missing writer means the transport is dead.
                if shared.writer.lock().await.is_some() {
                    continue;
                }
            }
        }

        shared.writer.lock().await.take();
        let (read_half, write_half) = dial(shared.addr, &shared.subscriptions).await;
        *shared.writer.lock().await = Some(write_half);
        shared.generation.send_modify(|generation| *generation += 1);
        reader = BufReader::new(read_half);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1)
    }

    #[tokio::test]
    async fn rejects_reserved_subscription_channel() {
        let result = Client::connect_to(unreachable_addr(), [SUBSCRIBE_CHANNEL]).await;
        assert!(matches!(result, Err(ClientError::InvalidChannel(_))));
    }

    #[tokio::test]
    async fn rejects_empty_subscription_channel() {
        let result = Client::connect_to(unreachable_addr(), [""]).await;
        assert!(matches!(result, Err(ClientError::InvalidChannel(_))));
    }
}
