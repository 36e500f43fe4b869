use std::sync::Arc;

use parley_storage::{KeyValueStore, StorageError};
use snafu::{ResultExt, Snafu};

use super::ids::SessionId;
use super::session::Session;

pub const SESSIONS_KEY: &str = "chatSessions";
pub const ACTIVE_SESSION_KEY: &str = "activeChatSessionId";
/// Holds the last stored collection that could not be fully decoded.
pub const UNREADABLE_SESSIONS_KEY: &str = "chatSessions.unreadable";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistenceError {
    #[snafu(display("persistent store failed on `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode sessions on `{stage}`, {source}"))]
    EncodeSessions {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode stored sessions on `{stage}`, {source}"))]
    DecodeSessions {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub sessions: Vec<Session>,
    pub active_id: Option<SessionId>,
}

/// Maps the session collection onto the two well-known store keys.
#[derive(Clone)]
pub struct SessionPersistence {
    store: Arc<dyn KeyValueStore>,
}

impl SessionPersistence {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns `Ok(None)` when nothing (or an empty collection) was stored.
    pub fn load(&self) -> PersistenceResult<Option<PersistedState>> {
        let Some(raw_sessions) = self.store.get(SESSIONS_KEY).context(StoreSnafu {
            stage: "load-sessions",
        })?
        else {
            return Ok(None);
        };
        if raw_sessions.trim().is_empty() {
            return Ok(None);
        }

        let sessions = match self.decode_sessions(&raw_sessions) {
            Ok(sessions) => sessions,
            Err(error) => {
                self.preserve_unreadable(&raw_sessions);
                return Err(error);
            }
        };
        if sessions.is_empty() {
            return Ok(None);
        }

        let active_id = self
            .store
            .get(ACTIVE_SESSION_KEY)
            .context(StoreSnafu {
                stage: "load-active-session",
            })?
            .map(|raw| SessionId::new(raw.trim()));

        Ok(Some(PersistedState {
            sessions,
            active_id,
        }))
    }

    /// Decodes each stored session on its own so one bad entry only costs
    /// that entry. Skipped entries keep the raw collection in
    /// [`UNREADABLE_SESSIONS_KEY`].
    fn decode_sessions(&self, raw_sessions: &str) -> PersistenceResult<Vec<Session>> {
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(raw_sessions).context(DecodeSessionsSnafu {
                stage: "decode-session-list",
            })?;

        let total = entries.len();
        let sessions = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value::<Session>(entry) {
                Ok(session) => Some(session),
                Err(error) => {
                    tracing::warn!(index, error = %error, "skipping unreadable stored session");
                    None
                }
            })
            .collect::<Vec<_>>();

        if sessions.len() < total {
            self.preserve_unreadable(raw_sessions);
        }
        Ok(sessions)
    }

    fn preserve_unreadable(&self, raw_sessions: &str) {
        match self.store.set(UNREADABLE_SESSIONS_KEY, raw_sessions) {
            Ok(()) => tracing::warn!(
                key = UNREADABLE_SESSIONS_KEY,
                bytes = raw_sessions.len(),
                "kept a copy of unreadable chat sessions"
            ),
            Err(error) => {
                tracing::error!(error = %error, "failed to keep a copy of unreadable chat sessions");
            }
        }
    }

    pub fn save(&self, sessions: &[Session], active_id: Option<&SessionId>) -> PersistenceResult<()> {
        let encoded = serde_json::to_string(sessions).context(EncodeSessionsSnafu {
            stage: "encode-sessions",
        })?;
        self.store.set(SESSIONS_KEY, &encoded).context(StoreSnafu {
            stage: "save-sessions",
        })?;

        if let Some(active_id) = active_id {
            self.store
                .set(ACTIVE_SESSION_KEY, active_id.as_str())
                .context(StoreSnafu {
                    stage: "save-active-session",
                })?;
        }
        Ok(())
    }

    pub fn clear(&self) -> PersistenceResult<()> {
        self.store.remove(SESSIONS_KEY).context(StoreSnafu {
            stage: "clear-sessions",
        })?;
        self.store.remove(ACTIVE_SESSION_KEY).context(StoreSnafu {
            stage: "clear-active-session",
        })
    }
}
