use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::bridge::ActiveBridge;
use crate::session::Session;

/// Key-value repository for sessions, keyed by user id.
pub trait SessionStore: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<Session>>;
    /// Fails if a session for this user already exists.
    fn create(&self, session: &Session) -> Result<()>;
    /// Fails if no session for this user exists.
    fn update(&self, session: &Session) -> Result<()>;
    fn delete(&self, user_id: &str) -> Result<bool>;
}

/// Persisted bridge records. Records are never deleted.
pub trait BridgeStore: Send + Sync {
    /// Insert or replace by `ActiveBridge::id`.
    fn save_bridge(&self, bridge: &ActiveBridge) -> Result<()>;
    fn get_bridge(&self, id: &str) -> Result<Option<ActiveBridge>>;
    /// Open (not completed, not superseded) bridges for a user, oldest first.
    fn open_bridges_for(&self, user_id: &str) -> Result<Vec<ActiveBridge>>;
    /// Open bridges across all users, oldest first.
    fn open_bridges(&self) -> Result<Vec<ActiveBridge>>;
    fn all_bridges(&self) -> Result<Vec<ActiveBridge>>;
}

/// In-process store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
    bridges: Mutex<HashMap<String, ActiveBridge>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn oldest_first(mut bridges: Vec<ActiveBridge>) -> Vec<ActiveBridge> {
    bridges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    bridges
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, user_id: &str) -> Result<Option<Session>> {
        Ok(lock(&self.sessions).get(user_id).cloned())
    }

    fn create(&self, session: &Session) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session.user_id) {
            bail!("Session for user {} already exists", session.user_id);
        }
        sessions.insert(session.user_id.clone(), session.clone());
        Ok(())
    }

    fn update(&self, session: &Session) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(&session.user_id) {
            Some(slot) => {
                *slot = session.clone();
                Ok(())
            }
            None => bail!("No session for user {}", session.user_id),
        }
    }

    fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(lock(&self.sessions).remove(user_id).is_some())
    }
}

impl BridgeStore for MemoryStore {
    fn save_bridge(&self, bridge: &ActiveBridge) -> Result<()> {
        lock(&self.bridges).insert(bridge.id.clone(), bridge.clone());
        Ok(())
    }

    fn get_bridge(&self, id: &str) -> Result<Option<ActiveBridge>> {
        Ok(lock(&self.bridges).get(id).cloned())
    }

    fn open_bridges_for(&self, user_id: &str) -> Result<Vec<ActiveBridge>> {
        let open = lock(&self.bridges)
            .values()
            .filter(|bridge| bridge.user_id == user_id && bridge.is_open())
            .cloned()
            .collect();
        Ok(oldest_first(open))
    }

    fn open_bridges(&self) -> Result<Vec<ActiveBridge>> {
        let open = lock(&self.bridges)
            .values()
            .filter(|bridge| bridge.is_open())
            .cloned()
            .collect();
        Ok(oldest_first(open))
    }

    fn all_bridges(&self) -> Result<Vec<ActiveBridge>> {
        Ok(oldest_first(lock(&self.bridges).values().cloned().collect()))
    }
}
