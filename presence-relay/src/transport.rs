//! One JSON document per TCP connection.
//!
//! A sender opens a connection, writes a single encoded envelope and closes
//! its write side. The receiver reads until EOF and decodes whatever arrived.
//! There is no length prefix and no multiplexing, so message boundaries are
//! connection boundaries.

use std::{fmt, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::JoinSet,
    time::timeout,
};
use tracing::{Instrument, debug, trace, warn};

use crate::envelope::{decode, encode};

/// Upper bound on a single frame. Anything longer is dropped as malformed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// How long `accept` may block before the loop re-checks the shutdown flag.
pub const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Per-read timeout while waiting for a slow sender. Expiry is retried.
pub const READ_POLL: Duration = Duration::from_secs(1);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection without sending anything")]
    Empty,
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("frame is not a JSON document: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame is not a recognised envelope: {0}")]
    Protocol(#[source] serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("connecting to {address} timed out")]
    ConnectTimeout { address: PeerAddress },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A declared `(host, port)` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Sender half of the process-wide shutdown flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    flag: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.flag.send_replace(true);
    }
}

/// Receiver half of the shutdown flag, checked by the accept loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is raised. Never resolves if the trigger was
    /// dropped without firing.
    pub async fn triggered(&mut self) {
        let closed = self.flag.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (flag, observer) = watch::channel(false);
    (ShutdownTrigger { flag }, Shutdown { flag: observer })
}

/// Receives decoded envelopes from [`serve`].
pub trait EnvelopeHandler: Send + Sync + 'static {
    type Envelope: DeserializeOwned + Send + 'static;

    fn handle(
        &self,
        envelope: Self::Envelope,
        peer: SocketAddr,
    ) -> impl Future<Output = ()> + Send;
}

pub async fn bind(address: &PeerAddress) -> Result<TcpListener> {
    TcpListener::bind((address.host.as_str(), address.port))
        .await
        .with_context(|| format!("failed to bind {address}"))
}

/// Accepts connections until `shutdown` fires, handling each on its own task.
///
/// Once the flag is raised, connections still waiting for their frame are
/// abandoned. Handlers already working on a decoded envelope are awaited
/// before this returns.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>, mut shutdown: Shutdown)
where
    H: EnvelopeHandler,
{
    let mut connections = JoinSet::new();
    let connection_shutdown = shutdown.clone();

    while !shutdown.is_triggered() {
        select! {
            _ = shutdown.triggered() => break,
            accepted = timeout(ACCEPT_POLL, listener.accept()) => match accepted {
                Ok(Ok((stream, peer))) => {
                    spawn_connection(&mut connections, stream, peer, &handler, &connection_shutdown)
                }
                Ok(Err(err)) => warn!(error = ?err, "failed to accept connection"),
                Err(_) => trace!("no connection within accept window"),
            },
        }
        reap_finished(&mut connections);
    }

    debug!(in_flight = connections.len(), "listener stopped accepting");
    while let Some(result) = connections.join_next().await {
        log_join_result(result);
    }
}

fn spawn_connection<H>(
    connections: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: &Arc<H>,
    shutdown: &Shutdown,
) where
    H: EnvelopeHandler,
{
    let handler = Arc::clone(handler);
    let mut shutdown = shutdown.clone();
    connections.spawn(
        async move {
            debug!(%peer, "connection accepted");
            let mut stream = stream;
            // A connection without a complete frame has no request in flight
            // yet, so shutdown may abandon it.
            let received = select! {
                received = receive_envelope::<_, H::Envelope>(&mut stream) => received,
                _ = shutdown.triggered() => {
                    debug!(%peer, "shutdown before frame completed; connection dropped");
                    return;
                }
            };
            match received {
                Ok(envelope) => handler.handle(envelope, peer).await,
                Err(err) => log_dropped_frame(peer, &err),
            }
        }
        .in_current_span(),
    );
}

fn log_dropped_frame(peer: SocketAddr, err: &FrameError) {
    match err {
        FrameError::Empty => debug!(%peer, "empty frame dropped"),
        FrameError::Protocol(_) => warn!(%peer, error = %err, "protocol violation dropped"),
        _ => warn!(%peer, error = %err, "malformed frame dropped"),
    }
}

fn reap_finished(connections: &mut JoinSet<()>) {
    while let Some(result) = connections.try_join_next() {
        log_join_result(result);
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        warn!(error = ?err, "connection handler failed");
    }
}

/// Reads until the peer closes its write side and returns the raw bytes.
pub async fn receive_one<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let read = match timeout(READ_POLL, reader.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => {
                trace!(received = frame.len(), "peer is slow; still waiting");
                continue;
            }
        };
        if read == 0 {
            break;
        }
        if frame.len() + read > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                limit: MAX_FRAME_BYTES,
            });
        }
        frame.extend_from_slice(&chunk[..read]);
    }

    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(frame)
}

pub async fn receive_envelope<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = receive_one(reader).await?;
    decode(&frame)
}

/// Writes one envelope and closes the write side, marking the frame's end.
pub async fn write_one<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode(message)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Opens a fresh connection to `to`, sends one envelope and closes it.
pub async fn send_one<T>(to: &PeerAddress, message: &T) -> Result<(), FrameError>
where
    T: Serialize,
{
    let connect = TcpStream::connect((to.host.as_str(), to.port));
    let mut stream = match timeout(CONNECT_TIMEOUT, connect).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(FrameError::ConnectTimeout {
                address: to.clone(),
            });
        }
    };
    write_one(&mut stream, message).await
}
