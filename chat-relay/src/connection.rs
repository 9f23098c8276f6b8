//! One accepted client transport.
//!
//! The read half is owned by [`Connection::receive_loop`]; the write half sits
//! behind an async mutex so that routed messages from other sessions and
//! server-wide broadcasts never interleave on the socket.

use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::{Mutex, watch},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    message::{Command, FrameError, Response, read_message, write_message},
    router::{Flow, Router},
};

pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub const SERVER_CLOSE_MESSAGE: &str = "server has been shut down";

/// How long a stopping server waits for a peer to accept `SERVER_CLOSE`.
pub const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("failed to write response: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer did not accept the response within {0:?}")]
    TimedOut(Duration),
}

/// How a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The connection was closed locally, by its router or by another task.
    Closed,
    /// The peer closed its write direction.
    PeerHangup,
    /// Reading failed or the peer sent something that is not a frame.
    TransportFailure,
    /// The listener is stopping.
    ServerShutdown,
}

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    nickname: OnceLock<String>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
    close_notified: AtomicBool,
    writer: Mutex<Option<BoxedWriter>>,
}

impl Connection {
    pub fn new<W>(peer: Option<SocketAddr>, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_signal, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            nickname: OnceLock::new(),
            closed: AtomicBool::new(false),
            closed_signal,
            close_notified: AtomicBool::new(false),
            writer: Mutex::new(Some(Box::new(writer))),
        })
    }

    pub fn from_tcp(stream: TcpStream) -> (Arc<Self>, BufReader<OwnedReadHalf>) {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        (Self::new(peer, writer), BufReader::new(reader))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The nickname this connection registered, once registration succeeded.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.get().map(String::as_str)
    }

    pub(crate) fn assign_nickname(&self, nickname: &str) {
        if self.nickname.set(nickname.to_string()).is_err() {
            warn!(id = self.id, nickname, "connection already has a nickname");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, response: &Response) -> Result<(), SendError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(SendError::Closed)?;
        write_message(writer, response).await?;
        Ok(())
    }

    /// Like [`send`](Self::send), but gives up once `limit` has elapsed,
    /// including time spent waiting behind other writers.
    async fn send_within(&self, response: &Response, limit: Duration) -> Result<(), SendError> {
        timeout(limit, self.send(response))
            .await
            .map_err(|_| SendError::TimedOut(limit))?
    }

    /// Sends `SERVER_CLOSE` to `target` unless this connection already got
    /// one. Bounded by [`CLOSE_NOTICE_TIMEOUT`].
    pub async fn notify_server_close(&self, target: &str) -> Result<(), SendError> {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let notice = Response::server_close(target, SERVER_CLOSE_MESSAGE);
        self.send_within(&notice, CLOSE_NOTICE_TIMEOUT).await
    }

    /// Shuts the write direction down and wakes the receive loop. Only the
    /// first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_signal.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(id = self.id, ?err, "failed to shut down writer cleanly");
            }
        }
        debug!(id = self.id, peer = ?self.peer, "connection closed");
    }

    /// Decodes commands one at a time and hands them to `router` until the
    /// connection closes, the transport fails, or `shutdown` flips to true.
    pub async fn receive_loop<R>(
        &self,
        reader: &mut R,
        router: &mut Router,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopExit
    where
        R: AsyncBufRead + Unpin,
    {
        let mut closed = self.closed_signal.subscribe();

        let exit = loop {
            if self.is_closed() {
                break LoopExit::Closed;
            }
            let server_stopping = *shutdown.borrow_and_update();
            if server_stopping {
                break LoopExit::ServerShutdown;
            }

            let frame = select! {
                _ = closed.changed() => continue,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break LoopExit::ServerShutdown;
                    }
                    continue;
                }
                frame = read_message::<_, Command>(reader) => frame,
            };

            match frame {
                Ok(Some(command)) => {
                    if router.dispatch(command).await == Flow::Close {
                        break LoopExit::Closed;
                    }
                }
                Ok(None) => {
                    debug!(id = self.id, "peer closed the connection");
                    break LoopExit::PeerHangup;
                }
                Err(err) if err.is_fatal() => {
                    match err {
                        FrameError::Io(err) => {
                            debug!(id = self.id, ?err, "failed to read from connection")
                        }
                        err => warn!(id = self.id, error = %err, "dropping connection"),
                    }
                    break LoopExit::TransportFailure;
                }
                Err(err) => {
                    warn!(id = self.id, error = %err, "rejecting invalid command");
                    let target = self.nickname().unwrap_or_default();
                    let reply = Response::error(target, format!("invalid command: {err}"));
                    if let Err(err) = self.send(&reply).await {
                        debug!(id = self.id, ?err, "failed to report invalid command");
                    }
                }
            }
        };

        if exit == LoopExit::ServerShutdown {
            router.server_closing().await;
        }
        self.close().await;
        exit
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("nickname", &self.nickname.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}
