//! Persistent session registry: logical session id → browser tab id.
//!
//! All mutations are funneled through a single writer task, so
//! concurrent register/touch/unregister calls never lose writes and the
//! on-disk JSON is rewritten whole, race-free by construction. Reads go
//! straight to the in-memory map and may observe state not yet flushed;
//! callers that need durability await the mutation itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// File name of the registry under the storage root.
pub const SESSIONS_FILE: &str = "sessions.json";

/// Errors from registry mutations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to persist session registry: {0}")]
    Persist(String),

    #[error("Session registry writer is gone")]
    WriterGone,
}

/// One registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub target_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// On-disk schema: `{"sessions": {...}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    sessions: HashMap<String, SessionEntry>,
}

enum Mutation {
    Register {
        session_id: String,
        target_id: String,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    Touch {
        session_id: String,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
    Unregister {
        session_id: String,
        done: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// The session registry with a serialized write queue.
pub struct SessionManager {
    map: Arc<RwLock<HashMap<String, SessionEntry>>>,
    tx: mpsc::UnboundedSender<Mutation>,
}

impl SessionManager {
    /// Load the registry from `<storage_dir>/sessions.json` and start
    /// the writer task. A missing file yields an empty registry; a
    /// corrupt file is logged and treated as empty. Never fails.
    pub async fn load(storage_dir: impl AsRef<Path>) -> Self {
        let path = storage_dir.as_ref().join(SESSIONS_FILE);

        let sessions = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistryFile>(&bytes) {
                Ok(file) => file.sessions,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Session registry unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let map = Arc::new(RwLock::new(sessions));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(map.clone(), path, rx));

        Self { map, tx }
    }

    /// Bind a session id to a browser target.
    pub async fn register(
        &self,
        session_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.mutate(|done| Mutation::Register {
            session_id: session_id.into(),
            target_id: target_id.into(),
            done,
        })
        .await
    }

    /// Refresh a session's last-used timestamp.
    pub async fn touch(&self, session_id: impl Into<String>) -> Result<(), SessionError> {
        self.mutate(|done| Mutation::Touch {
            session_id: session_id.into(),
            done,
        })
        .await
    }

    /// Remove a session binding.
    pub async fn unregister(&self, session_id: impl Into<String>) -> Result<(), SessionError> {
        self.mutate(|done| Mutation::Unregister {
            session_id: session_id.into(),
            done,
        })
        .await
    }

    /// Target bound to the given session, from the in-memory map.
    pub fn target_id(&self, session_id: &str) -> Option<String> {
        self.map
            .read()
            .unwrap()
            .get(session_id)
            .map(|entry| entry.target_id.clone())
    }

    /// All registered sessions, sorted by id.
    pub fn list(&self) -> Vec<(String, SessionEntry)> {
        let mut entries: Vec<_> = self
            .map
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    async fn mutate(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SessionError>>) -> Mutation,
    ) -> Result<(), SessionError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(build(done))
            .map_err(|_| SessionError::WriterGone)?;
        wait.await.map_err(|_| SessionError::WriterGone)?
    }
}

/// Single consumer: applies mutations in arrival order and rewrites the
/// file after each one.
async fn writer_loop(
    map: Arc<RwLock<HashMap<String, SessionEntry>>>,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<Mutation>,
) {
    while let Some(mutation) = rx.recv().await {
        let done = match mutation {
            Mutation::Register {
                session_id,
                target_id,
                done,
            } => {
                let now = Utc::now();
                map.write().unwrap().insert(
                    session_id.clone(),
                    SessionEntry {
                        target_id,
                        created_at: now,
                        last_used: now,
                    },
                );
                debug!(session_id = %session_id, "Session registered");
                done
            }
            Mutation::Touch { session_id, done } => {
                if let Some(entry) = map.write().unwrap().get_mut(&session_id) {
                    entry.last_used = Utc::now();
                }
                done
            }
            Mutation::Unregister { session_id, done } => {
                map.write().unwrap().remove(&session_id);
                debug!(session_id = %session_id, "Session unregistered");
                done
            }
        };

        let _ = done.send(save(&map, &path).await);
    }
}

async fn save(
    map: &Arc<RwLock<HashMap<String, SessionEntry>>>,
    path: &Path,
) -> Result<(), SessionError> {
    let snapshot = RegistryFile {
        sessions: map.read().unwrap().clone(),
    };
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|err| SessionError::Persist(err.to_string()))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| SessionError::Persist(err.to_string()))?;
    }
    tokio::fs::write(path, json)
        .await
        .map_err(|err| SessionError::Persist(err.to_string()))
}
