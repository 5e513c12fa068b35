use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A session as it sits in storage, history already encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub user: String,
    pub history: String,
    pub turn_count: usize,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Listing view of a stored session, without the history body.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub user: String,
    pub turn_count: usize,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            user: record.user.clone(),
            turn_count: record.turn_count,
            token_count: record.token_count,
            created_at: record.created_at,
            last_active: record.last_active,
        }
    }
}

/// Durable key-value storage for session records.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace the record with the same id.
    async fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Every stored session, most recently active first.
    async fn list(&self) -> Result<Vec<SessionSummary>>;

    /// Remove records whose last activity is strictly before `cutoff`.
    async fn delete_idle(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("session storage lock poisoned")
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(id).cloned())
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(records.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut summaries: Vec<SessionSummary> =
            records.values().map(SessionSummary::from).collect();
        summaries.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(summaries)
    }

    async fn delete_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|_, r| r.last_active >= cutoff);
        Ok(before - records.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn record(id: &str, user: &str, last_active: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            user: user.to_string(),
            history: r#"{"version":1,"turns":[]}"#.to_string(),
            turn_count: 0,
            token_count: 0,
            created_at: last_active,
            last_active,
        }
    }

    /// Behaviour every backend must share.
    pub(crate) async fn exercise_storage(storage: &dyn SessionStorage) {
        let now = Utc::now();
        assert!(storage.load("user:a").await.unwrap().is_none());

        storage.save(&record("user:a", "a", now)).await.unwrap();
        let mut newer = record("user:b", "b", now + Duration::seconds(5));
        storage.save(&newer).await.unwrap();

        newer.token_count = 42;
        newer.turn_count = 3;
        storage.save(&newer).await.unwrap();
        let loaded = storage.load("user:b").await.unwrap().unwrap();
        assert_eq!(loaded.token_count, 42);
        assert_eq!(loaded.turn_count, 3);

        let ids: Vec<String> = storage
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["user:b", "user:a"]);

        let purged = storage
            .delete_idle(now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(storage.load("user:a").await.unwrap().is_none());

        assert!(storage.delete("user:b").await.unwrap());
        assert!(!storage.delete("user:b").await.unwrap());
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage_contract() {
        exercise_storage(&MemoryStorage::new()).await;
    }
}
