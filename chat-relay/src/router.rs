//! Per-connection protocol state machine.
//!
//! A session starts [`Unregistered`](Session::Unregistered), becomes
//! [`Registered`](Session::Registered) after a successful `CONNECT`, and ends
//! [`Closed`](Session::Closed). Routed traffic is only accepted while
//! registered.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, LoopExit},
    directory::{Directory, RegisterError},
    message::{Command, CommandKind, Response},
};

/// What the receive loop should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Unregistered,
    Registered { nickname: String },
    Closed,
}

pub struct Router {
    connection: Arc<Connection>,
    directory: Arc<Directory>,
    session: Session,
}

impl Router {
    pub fn new(connection: Arc<Connection>, directory: Arc<Directory>) -> Self {
        Self {
            connection,
            directory,
            session: Session::Unregistered,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn dispatch(&mut self, command: Command) -> Flow {
        match &self.session {
            Session::Unregistered => self.dispatch_unregistered(command).await,
            Session::Registered { nickname } => {
                let nickname = nickname.clone();
                self.dispatch_registered(nickname, command).await
            }
            Session::Closed => Flow::Close,
        }
    }

    async fn dispatch_unregistered(&mut self, command: Command) -> Flow {
        match command.kind {
            CommandKind::Connect => self.handle_connect(command.sender_nick).await,
            CommandKind::Disconnect => {
                debug!(id = self.connection.id(), "disconnect before registration");
                self.close().await
            }
            kind => {
                warn!(id = self.connection.id(), ?kind, "command before registration");
                self.reply(Response::error(
                    &command.sender_nick,
                    "CONNECT must be the first command",
                ))
                .await;
                self.close().await
            }
        }
    }

    async fn dispatch_registered(&mut self, nickname: String, command: Command) -> Flow {
        if command.sender_nick != nickname {
            debug!(
                %nickname,
                claimed = %command.sender_nick,
                "ignoring sender nickname supplied by client"
            );
        }

        match command.kind {
            CommandKind::Connect => {
                self.reply(Response::error(
                    &nickname,
                    format!("already connected as {nickname}"),
                ))
                .await;
                Flow::Continue
            }
            CommandKind::StartConversation | CommandKind::SendMessage => {
                let response =
                    Response::message(&command.addressee_nick, command.message, &nickname);
                self.route(&command.addressee_nick, response).await;
                Flow::Continue
            }
            CommandKind::EndConversation => {
                let response =
                    Response::end_conversation(&command.addressee_nick, command.message, &nickname);
                self.route(&command.addressee_nick, response).await;
                Flow::Continue
            }
            CommandKind::Disconnect => {
                self.session = Session::Closed;
                self.directory.unregister(&nickname).await;
                info!(peer = ?self.connection.peer(), %nickname, "client disconnected");
                self.announce(format!("user {nickname} left")).await;
                self.close().await
            }
        }
    }

    async fn handle_connect(&mut self, nickname: String) -> Flow {
        if nickname.trim().is_empty() {
            self.reply(Response::reject_connection(
                &nickname,
                "nickname cannot be empty",
            ))
            .await;
            return self.close().await;
        }

        match self.directory.register(&nickname, &self.connection).await {
            Ok(()) => {
                self.connection.assign_nickname(&nickname);
                info!(peer = ?self.connection.peer(), %nickname, "client joined");
                self.session = Session::Registered {
                    nickname: nickname.clone(),
                };
                self.announce(format!("user {nickname} joined")).await;
                Flow::Continue
            }
            Err(err @ RegisterError::NickInUse(_)) => {
                info!(peer = ?self.connection.peer(), %nickname, "rejecting connection: {err}");
                self.reply(Response::reject_connection(&nickname, err.to_string()))
                    .await;
                self.close().await
            }
        }
    }

    /// Unicast to `addressee`; silently dropped when nobody holds that nickname.
    async fn route(&self, addressee: &str, response: Response) {
        let Some(recipient) = self.directory.lookup(addressee).await else {
            debug!(addressee, "dropping message for offline nickname");
            return;
        };
        if let Err(err) = recipient.send(&response).await {
            debug!(addressee, error = %err, "failed to deliver message");
        }
    }

    async fn announce(&self, message: String) {
        self.directory
            .broadcast(|target, nicknames| Response::users(target, nicknames.to_vec(), &message))
            .await;
    }

    async fn reply(&self, response: Response) {
        if let Err(err) = self.connection.send(&response).await {
            debug!(id = self.connection.id(), error = %err, "failed to reply");
        }
    }

    async fn close(&mut self) -> Flow {
        self.session = Session::Closed;
        self.connection.close().await;
        Flow::Close
    }

    /// Tells a registered client the server is going away. Called by the
    /// receive loop before the connection closes; covers sessions that
    /// registered after `stop` sent its notices.
    pub async fn server_closing(&self) {
        let Session::Registered { nickname } = &self.session else {
            return;
        };
        if let Err(err) = self.connection.notify_server_close(nickname).await {
            debug!(%nickname, error = %err, "failed to deliver server close notice");
        }
    }

    /// Releases the nickname of a session that ended without `DISCONNECT`.
    ///
    /// Peers are told through a `USERS` broadcast unless the whole server is
    /// stopping, in which case they get `SERVER_CLOSE` instead.
    pub async fn finish(&mut self, exit: LoopExit) {
        let Session::Registered { nickname } = std::mem::replace(&mut self.session, Session::Closed)
        else {
            return;
        };

        self.directory.unregister(&nickname).await;
        if exit == LoopExit::ServerShutdown {
            debug!(%nickname, "released nickname during shutdown");
            return;
        }

        info!(peer = ?self.connection.peer(), %nickname, ?exit, "client dropped");
        self.announce(format!("user {nickname} left")).await;
    }
}
