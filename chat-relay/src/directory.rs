use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{connection::Connection, message::Response};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("nickname '{0}' is already in use")]
    NickInUse(String),
}

/// Nickname → connection registry shared by every session.
///
/// Entries hold weak references: the directory never keeps a connection alive
/// and never closes one. An entry whose connection has been dropped counts as
/// absent.
#[derive(Default)]
pub struct Directory {
    entries: Mutex<HashMap<String, Weak<Connection>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        nickname: &str,
        connection: &Arc<Connection>,
    ) -> Result<(), RegisterError> {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(nickname) {
            if existing.strong_count() > 0 {
                return Err(RegisterError::NickInUse(nickname.to_string()));
            }
            debug!(nickname, "replacing stale directory entry");
        }

        entries.insert(nickname.to_string(), Arc::downgrade(connection));
        Ok(())
    }

    /// Removes `nickname`. Returns whether an entry was present.
    pub async fn unregister(&self, nickname: &str) -> bool {
        self.entries.lock().await.remove(nickname).is_some()
    }

    pub async fn lookup(&self, nickname: &str) -> Option<Arc<Connection>> {
        self.entries.lock().await.get(nickname)?.upgrade()
    }

    pub async fn snapshot_nicks(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        live_nicknames(&entries)
    }

    /// Live `(nickname, connection)` pairs at one instant.
    pub async fn recipients(&self) -> Vec<(String, Arc<Connection>)> {
        let entries = self.entries.lock().await;
        live_connections(&entries)
    }

    /// Sends `build(target, nicknames)` to every registered connection.
    ///
    /// Recipients and `nicknames` come from one atomic snapshot; delivery
    /// happens after the lock is released. A failed write is logged and does
    /// not stop delivery to the others. Returns the number of recipients that
    /// accepted the response.
    pub async fn broadcast<F>(&self, build: F) -> usize
    where
        F: Fn(&str, &[String]) -> Response,
    {
        let (recipients, nicknames) = {
            let entries = self.entries.lock().await;
            (live_connections(&entries), live_nicknames(&entries))
        };

        let deliveries = recipients.iter().map(|(nickname, connection)| {
            let response = build(nickname.as_str(), nicknames.as_slice());
            async move {
                match connection.send(&response).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%nickname, id = connection.id(), error = %err, "broadcast delivery failed");
                        false
                    }
                }
            }
        });

        join_all(deliveries)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }
}

fn live_connections(entries: &HashMap<String, Weak<Connection>>) -> Vec<(String, Arc<Connection>)> {
    entries
        .iter()
        .filter_map(|(nickname, entry)| Some((nickname.clone(), entry.upgrade()?)))
        .collect()
}

fn live_nicknames(entries: &HashMap<String, Weak<Connection>>) -> Vec<String> {
    let mut nicknames: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.strong_count() > 0)
        .map(|(nickname, _)| nickname.clone())
        .collect();
    nicknames.sort();
    nicknames
}
