use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::storage::{SessionStorage, SessionSummary};
use super::{Session, SessionKey};
use crate::error::{AgentError, Result};
use crate::history::Turn;

type Slot = Arc<Mutex<Option<Session>>>;

enum Lookup {
    Live,
    Expired,
    Absent,
}

/// Keyed, idle-expiring session store.
///
/// Each key owns a slot guarded by an async mutex, so at most one request
/// operates on a session at a time while different keys proceed in parallel.
/// The slot caches the last persisted state; storage stays the source of truth.
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    slots: DashMap<String, Slot>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>, idle_timeout: Duration) -> Self {
        Self::with_clock(storage, idle_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn SessionStorage>,
        idle_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            clock,
            idle_timeout,
            slots: DashMap::new(),
        }
    }

    /// Sessions currently cached in memory.
    pub fn cached(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        self.slots.entry(key.storage_id()).or_default().clone()
    }

    fn idle_limit(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::MAX)
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.last_active) > self.idle_limit()
    }

    /// Fill the slot from storage if needed, then apply ownership and expiry checks.
    /// An expired session is dropped from both the slot and storage.
    async fn lookup(
        &self,
        cached: &mut Option<Session>,
        key: &SessionKey,
        now: DateTime<Utc>,
    ) -> Result<Lookup> {
        let id = key.storage_id();
        if cached.is_none() {
            if let Some(record) = self.storage.load(&id).await.map_err(AgentError::storage)? {
                *cached = Some(Session::from_record(record)?);
            }
        }

        let Some(session) = cached.as_ref() else {
            return Ok(Lookup::Absent);
        };
        if session.user != key.user() {
            warn!(
                "User '{}' presented token for a session owned by '{}'",
                key.user(),
                session.user
            );
            return Err(AgentError::SessionForbidden {
                session: id,
                user: key.user().to_string(),
            });
        }
        if self.is_expired(session, now) {
            info!(
                "Session {key} expired after {}s idle",
                now.signed_duration_since(session.last_active).num_seconds()
            );
            *cached = None;
            self.storage.delete(&id).await.map_err(AgentError::storage)?;
            return Ok(Lookup::Expired);
        }
        Ok(Lookup::Live)
    }

    /// Take exclusive hold of the session for `key`, creating it if absent or expired.
    ///
    /// Waits while another holder has the same key.
    pub async fn checkout(&self, key: &SessionKey) -> Result<SessionLease> {
        let mut guard = self.slot(key).lock_owned().await;
        let now = self.clock.now();
        match self.lookup(&mut guard, key, now).await? {
            Lookup::Live => {}
            Lookup::Expired | Lookup::Absent => {
                info!("Creating new session {key}");
                *guard = Some(Session::new(key, now));
            }
        }
        let session = guard.take().unwrap_or_else(|| Session::new(key, now));
        Ok(SessionLease {
            persisted_len: session.turns().len(),
            session,
            guard,
            storage: self.storage.clone(),
            clock: self.clock.clone(),
        })
    }

    /// Run `f` with exclusive access to the session for `key`.
    ///
    /// `f` receives the lease and hands it back along with its result. The
    /// session is persisted and its idle timer reset before this returns,
    /// whether `f` succeeded or not. If `f` panics or is cancelled the lease
    /// is dropped, the lock released and unsaved turns discarded.
    pub async fn with_exclusive_session<T, F, Fut>(&self, key: &SessionKey, f: F) -> Result<T>
    where
        F: FnOnce(SessionLease) -> Fut,
        Fut: Future<Output = (SessionLease, Result<T>)>,
    {
        let lease = self.checkout(key).await?;
        let (lease, outcome) = f(lease).await;
        let committed = lease.commit().await;
        let value = outcome?;
        committed?;
        Ok(value)
    }

    /// Snapshot of the session for `key`, creating it if absent or expired.
    ///
    /// A freshly created session is not written to storage until something is appended.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        let lease = self.checkout(key).await?;
        Ok(lease.session().clone())
    }

    /// Snapshot of an existing live session.
    pub async fn get_existing(&self, key: &SessionKey) -> Result<Session> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        match self.lookup(&mut guard, key, self.clock.now()).await? {
            Lookup::Live => guard
                .as_ref()
                .cloned()
                .ok_or_else(|| AgentError::SessionNotFound(key.to_string())),
            Lookup::Expired => Err(AgentError::SessionExpired(key.to_string())),
            Lookup::Absent => Err(AgentError::SessionNotFound(key.to_string())),
        }
    }

    /// Discard the session for `key`. The next request starts an empty history.
    pub async fn reset(&self, key: &SessionKey) -> Result<()> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let id = key.storage_id();
        // Ownership comes from the raw record so a corrupt history can still be reset.
        let owner = match guard.as_ref() {
            Some(session) => Some(session.user.clone()),
            None => self
                .storage
                .load(&id)
                .await
                .map_err(AgentError::storage)?
                .map(|record| record.user),
        };
        if owner.is_some_and(|owner| owner != key.user()) {
            return Err(AgentError::SessionForbidden {
                session: id,
                user: key.user().to_string(),
            });
        }
        *guard = None;
        let removed = self.storage.delete(&id).await.map_err(AgentError::storage)?;
        info!("Reset session {key} (stored: {removed})");
        Ok(())
    }

    /// Stored sessions, most recently active first.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.storage.list().await.map_err(AgentError::storage)
    }

    /// Drop every session idle past the timeout, from memory and storage.
    ///
    /// Slots that are in use are skipped. Returns how many stored sessions were removed.
    pub async fn evict_idle(&self) -> Result<usize> {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(cached) => match cached.as_ref() {
                    Some(session) => !self.is_expired(session, now),
                    None => false,
                },
                Err(_) => true,
            }
        });
        let dropped = before.saturating_sub(self.slots.len());

        let cutoff = now
            .checked_sub_signed(self.idle_limit())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self
            .storage
            .delete_idle(cutoff)
            .await
            .map_err(AgentError::storage)?;
        if dropped > 0 || purged > 0 {
            info!("Evicted {purged} idle session(s), released {dropped} cached slot(s)");
        }
        Ok(purged)
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.evict_idle().await {
                    warn!("Idle session sweep failed: {e}");
                }
            }
        })
    }
}

/// Exclusive hold on one session.
///
/// Turns appended through the lease become durable at [`checkpoint`](Self::checkpoint).
/// Dropping the lease releases the lock and forgets anything not yet checkpointed.
pub struct SessionLease {
    session: Session,
    guard: OwnedMutexGuard<Option<Session>>,
    storage: Arc<dyn SessionStorage>,
    clock: Arc<dyn Clock>,
    persisted_len: usize,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn turns(&self) -> &[Turn] {
        self.session.turns()
    }

    pub fn append(&mut self, turn: Turn) {
        self.session.push(turn);
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.session.token_count = self.session.token_count.saturating_add(tokens);
    }

    /// Persist everything appended so far and reset the idle timer.
    ///
    /// On failure the unsaved turns are dropped, leaving the last persisted
    /// prefix, which is always loadable.
    pub async fn checkpoint(&mut self) -> Result<()> {
        self.session.last_active = self.clock.now();
        let saved = match self.session.to_record() {
            Ok(record) => self.storage.save(&record).await.map_err(AgentError::storage),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            warn!(
                "Discarding {} unsaved turn(s) of session {}: {e}",
                self.session.turns().len() - self.persisted_len,
                self.session.id
            );
            self.session.truncate(self.persisted_len);
            return Err(e);
        }
        self.persisted_len = self.session.turns().len();
        debug!(
            "Saved session {} ({} turns, {} tokens)",
            self.session.id, self.persisted_len, self.session.token_count
        );
        Ok(())
    }

    /// Final checkpoint, then release.
    pub async fn commit(mut self) -> Result<()> {
        self.checkpoint().await
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut session = std::mem::take(&mut self.session);
        session.truncate(self.persisted_len);
        *self.guard = Some(session);
    }
}
