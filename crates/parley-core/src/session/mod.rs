pub mod clock;
pub mod sqlite;
pub mod storage;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use sqlite::SqliteStorage;
pub use storage::{MemoryStorage, SessionRecord, SessionStorage, SessionSummary};
pub use store::{SessionLease, SessionStore};

use std::fmt;

use chrono::{DateTime, Utc};

use crate::history::{self, CodecError, Turn};

/// Identity of a conversation: a user plus an optional session token.
///
/// Without a token each user has one implicit session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    user: String,
    token: Option<String>,
}

impl SessionKey {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: None,
        }
    }

    pub fn with_token(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: Some(token.into()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Key under which the session is persisted.
    ///
    /// Token sessions are stored by token alone so a token presented by the
    /// wrong user can be detected rather than silently opening a new session.
    pub fn storage_id(&self) -> String {
        match &self.token {
            Some(token) => format!("token:{token}"),
            None => format!("user:{}", self.user),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(f, "{}#{token}", self.user),
            None => f.write_str(&self.user),
        }
    }
}

/// A conversation: ordered turns plus bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    pub user: String,
    turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Tokens consumed by every model call made for this session.
    pub token_count: u64,
}

impl Session {
    pub fn new(key: &SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            id: key.storage_id(),
            user: key.user().to_string(),
            turns: Vec::new(),
            created_at: now,
            last_active: now,
            token_count: 0,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub(crate) fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Drop turns past `len`. Only used to discard turns that never reached storage.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    pub fn to_record(&self) -> Result<SessionRecord, CodecError> {
        Ok(SessionRecord {
            id: self.id.clone(),
            user: self.user.clone(),
            history: history::encode(&self.turns)?,
            turn_count: self.turns.len(),
            token_count: self.token_count,
            created_at: self.created_at,
            last_active: self.last_active,
        })
    }

    pub fn from_record(record: SessionRecord) -> Result<Self, CodecError> {
        Ok(Self {
            turns: history::decode(&record.history)?,
            id: record.id,
            user: record.user,
            created_at: record.created_at,
            last_active: record.last_active,
            token_count: record.token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_and_token_keys_store_apart() {
        let implicit = SessionKey::for_user("steve");
        let explicit = SessionKey::with_token("steve", "abc");
        assert_eq!(implicit.storage_id(), "user:steve");
        assert_eq!(explicit.storage_id(), "token:abc");
        assert_ne!(implicit, explicit);
        assert_eq!(explicit.to_string(), "steve#abc");
    }

    #[test]
    fn record_round_trip() {
        let now = Utc::now();
        let mut session = Session::new(&SessionKey::for_user("alex"), now);
        session.push(Turn::user("hi"));
        session.push(Turn::agent("hello"));
        session.token_count = 17;

        let record = session.to_record().unwrap();
        assert_eq!(record.turn_count, 2);

        let restored = Session::from_record(record).unwrap();
        assert_eq!(restored.turns(), session.turns());
        assert_eq!(restored.user, "alex");
        assert_eq!(restored.token_count, 17);
        assert_eq!(restored.created_at, now);
    }
}
