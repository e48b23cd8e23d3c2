use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use revloop_core::error::{Result, RevloopError};
use revloop_core::review::ReviewSession;
use revloop_core::traits::ReviewStore;
use revloop_core::types::SessionId;

/// Single-process review store keyed by session id.
#[derive(Default)]
pub struct MemoryReviewStore {
    sessions: Mutex<HashMap<SessionId, ReviewSession>>,
}

impl MemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, ReviewSession>>> {
        self.sessions
            .lock()
            .map_err(|e| RevloopError::Database(e.to_string()))
    }
}

impl ReviewStore for MemoryReviewStore {
    fn save<'a>(&'a self, session: &'a ReviewSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut sessions = self.lock()?;
            if let Some(stored) = sessions.get(&session.session_id) {
                if stored.version + 1 != session.version {
                    return Err(RevloopError::SessionConflict(session.session_id.to_string()));
                }
            }
            sessions.insert(session.session_id.clone(), session.clone());
            Ok(())
        })
    }

    fn load<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<Option<ReviewSession>>> {
        Box::pin(async move { Ok(self.lock()?.get(session_id).cloned()) })
    }

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.lock()?.remove(session_id).is_some()) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ReviewSession>>> {
        Box::pin(async move {
            let mut all: Vec<ReviewSession> = self.lock()?.values().cloned().collect();
            all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(all)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_delete() {
        let store = MemoryReviewStore::new();
        let mut session = ReviewSession::new(SessionId::from_string("m1"), "input");
        session.apply_initial("draft".into());
        store.save(&session).await.unwrap();

        let loaded = store.load(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        assert!(store.delete(&session.session_id).await.unwrap());
        assert!(!store.delete(&session.session_id).await.unwrap());
        assert!(store.load(&session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_existing() {
        let store = MemoryReviewStore::new();
        let mut session = ReviewSession::new(SessionId::from_string("m2"), "input");
        session.apply_initial("v1".into());
        store.save(&session).await.unwrap();
        session.apply_revision(vec!["more".into()], "v2".into());
        store.save(&session).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].candidate, "v2");
        assert_eq!(all[0].attempt, 2);
    }

    #[tokio::test]
    async fn stale_copy_cannot_overwrite() {
        let store = MemoryReviewStore::new();
        let mut session = ReviewSession::new(SessionId::from_string("m3"), "input");
        session.apply_initial("v1".into());
        store.save(&session).await.unwrap();

        let mut stale = session.clone();
        session.apply_approval();
        store.save(&session).await.unwrap();

        stale.apply_revision(vec!["late".into()], "v2".into());
        assert!(matches!(
            store.save(&stale).await,
            Err(RevloopError::SessionConflict(_))
        ));
        // saving the same version twice is also a conflict
        assert!(store.save(&session).await.is_err());
        assert_eq!(store.load(&session.session_id).await.unwrap().unwrap(), session);
    }
}
