//! Session Store - in-memory funnel sessions with JSON snapshots
//!
//! Sessions are held behind one async lock. Callers never keep the lock
//! across an oracle call; they re-acquire it to apply the reply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use super::session::FunnelSession;
use crate::error::{FunnelError, FunnelResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    sessions: Vec<FunnelSession>,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, FunnelSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: FunnelSession) {
        self.sessions.write().await.insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> FunnelResult<FunnelSession> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FunnelError::SessionNotFound(id.to_string()))
    }

    /// Run `f` against the session under the write lock.
    pub async fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FunnelSession) -> FunnelResult<T>,
    ) -> FunnelResult<T> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| FunnelError::SessionNotFound(id.to_string()))?;
        f(session)
    }

    pub async fn remove(&self, id: &str) -> Option<FunnelSession> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Save every session to disk
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut sessions: Vec<FunnelSession> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);

        let json = serde_json::to_string_pretty(&StoreSnapshot { sessions })
            .context("Failed to serialize sessions")?;
        fs::write(path, json).await.context("Failed to write session file")?;
        Ok(())
    }

    /// Load sessions from disk, replacing same-id entries. Missing file loads nothing.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let json = fs::read_to_string(path).await.context("Failed to read session file")?;
        let snapshot: StoreSnapshot =
            serde_json::from_str(&json).context("Failed to deserialize session file")?;

        let count = snapshot.sessions.len();
        let mut sessions = self.sessions.write().await;
        for session in snapshot.sessions {
            sessions.insert(session.id.clone(), session);
        }
        Ok(count)
    }

    /// Most recent session for a device, if any.
    pub async fn latest_for_device(&self, device_id: &str) -> Option<FunnelSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.device_id == device_id)
            .max_by_key(|s| s.created_at)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::context::{Budget, SocialGroup, UserContext};
    use crate::funnel::session::{FunnelPhase, PendingAction};
    use crate::themes::Environment;
    use tempfile::tempdir;

    fn session(device: &str) -> FunnelSession {
        let ctx = UserContext::new(SocialGroup::Solo, 3, Budget::Free, Environment::Home);
        FunnelSession::new(
            device,
            ctx,
            FunnelPhase::ThemeDuel {
                eligible: vec!["jeux".into(), "lecture".into()],
                remaining: vec!["jeux".into(), "lecture".into()],
                current: ("jeux".into(), "lecture".into()),
                history: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_update_and_missing_session() {
        let store = SessionStore::new();
        let s = session("d1");
        let id = s.id.clone();
        store.insert(s).await;

        store
            .update(&id, |s| {
                s.generation += 1;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.get(&id).await.unwrap().generation, 1);

        let err = store.update("nope", |_| Ok(())).await.unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let store = SessionStore::new();
        let s = session("d1");
        let id = s.id.clone();
        store.insert(s).await;
        store.insert(session("d2")).await;
        store.save(&path).await.unwrap();

        let restored = SessionStore::new();
        assert_eq!(restored.load(&path).await.unwrap(), 2);
        assert_eq!(restored.get(&id).await.unwrap(), store.get(&id).await.unwrap());
        assert_eq!(restored.latest_for_device("d2").await.unwrap().device_id, "d2");
    }

    #[tokio::test]
    async fn test_restored_session_is_idle() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let store = SessionStore::new();
        let mut s = session("d1");
        let id = s.id.clone();
        s.dispatch(PendingAction::Bill);
        store.insert(s).await;
        store.save(&path).await.unwrap();

        let restored = SessionStore::new();
        restored.load(&path).await.unwrap();
        let s = restored.get(&id).await.unwrap();
        assert!(!s.in_flight);
        assert_eq!(s.pending, Some(PendingAction::Bill));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = tempdir().unwrap();
        let store = SessionStore::new();
        assert_eq!(store.load(&temp_dir.path().join("none.json")).await.unwrap(), 0);
        assert_eq!(store.len().await, 0);
    }
}
