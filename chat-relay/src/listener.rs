use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{connection::Connection, directory::Directory, router::Router};

/// How long `stop` lets sessions wind down before aborting them.
const SESSION_DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Accepts client connections and owns the shared [`Directory`].
///
/// `start` and `stop` can be called any number of times; the directory
/// outlives individual runs.
pub struct Listener {
    directory: Arc<Directory>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(Directory::new()),
            running: Mutex::new(None),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Binds `addr` and spawns the accept loop. Returns the bound address
    /// (useful when `addr` asks for an ephemeral port).
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, StartError> {
        if let Some(bound) = self.local_addr() {
            return Err(StartError::AlreadyRunning(bound));
        }

        let bind_error = |source| StartError::Bind { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let mut running = self.running();
        if let Some(existing) = running.as_ref() {
            return Err(StartError::AlreadyRunning(existing.local_addr));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.directory),
            shutdown_rx,
        ));
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });

        info!(%local_addr, "server listening");
        Ok(local_addr)
    }

    /// Sends `SERVER_CLOSE` to every registered client, closes the listening
    /// socket, and waits for every session to end. Each notice is bounded by
    /// a timeout, and sessions still running after a grace period (a peer
    /// that stopped reading) are aborted, so this always returns. Returns
    /// `false` when the server was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running().take() else {
            return false;
        };

        info!(local_addr = %running.local_addr, "server shutting down");
        let recipients = self.directory.recipients().await;
        let notices = recipients.iter().map(|(nickname, connection)| async move {
            match connection.notify_server_close(nickname).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(%nickname, error = %err, "failed to send server close notice");
                    false
                }
            }
        });
        let notified = join_all(notices)
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count();
        debug!(notified, "sent server close notices");

        running.shutdown.send_replace(true);
        if let Err(err) = running.accept_task.await {
            warn!(error = ?err, "accept loop ended abnormally");
        }

        info!("server stopped");
        true
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.shutdown.send_replace(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    directory: Arc<Directory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        select! {
            _ = shutdown.changed() => break,
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &directory, &shutdown, &mut sessions);
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                log_session_result(joined);
            }
        }
    }

    drop(listener);
    debug!(remaining = sessions.len(), "listening socket closed");

    let drain = async {
        while let Some(joined) = sessions.join_next().await {
            log_session_result(joined);
        }
    };
    let drained = timeout(SESSION_DRAIN_GRACE, drain).await.is_ok();
    if !drained {
        warn!(remaining = sessions.len(), "aborting sessions that did not end in time");
        sessions.abort_all();
        while let Some(joined) = sessions.join_next().await {
            log_session_result(joined);
        }
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    directory: &Arc<Directory>,
    shutdown: &watch::Receiver<bool>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "accepted connection");
            sessions.spawn(run_session(
                stream,
                peer,
                Arc::clone(directory),
                shutdown.clone(),
            ));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    directory: Arc<Directory>,
    shutdown: watch::Receiver<bool>,
) {
    let (connection, mut reader) = Connection::from_tcp(stream);
    let mut router = Router::new(Arc::clone(&connection), directory);

    let exit = connection
        .receive_loop(&mut reader, &mut router, shutdown)
        .await;
    router.finish(exit).await;

    debug!(%peer, ?exit, "session ended");
}

fn log_session_result(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => debug!("client session aborted"),
        Err(err) => warn!(error = ?err, "client session panicked"),
    }
}
