//! Active relay sessions, by id.

use std::collections::HashMap;
use std::sync::Arc;

use provider_core::UpstreamSession;
use stream_core::{Session, SessionState};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

struct Entry {
    session: Session,
    upstream: Option<Arc<UpstreamSession>>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Session) {
        self.sessions.write().await.insert(
            session.id,
            Entry {
                session,
                upstream: None,
            },
        );
    }

    /// Remember the provider connection so it can be torn down from outside.
    pub async fn attach_upstream(&self, id: Uuid, upstream: Arc<UpstreamSession>) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(entry) => {
                entry.upstream = Some(upstream);
                true
            }
            None => false,
        }
    }

    pub async fn transition(&self, id: Uuid, next: SessionState) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(entry) => entry.session.transition(next),
            None => false,
        }
    }

    pub async fn remove(&self, id: Uuid) -> Option<Session> {
        self.sessions.write().await.remove(&id).map(|entry| entry.session)
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).map(|entry| entry.session.clone())
    }

    /// Sessions ordered by creation time.
    pub async fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> =
            self.sessions.read().await.values().map(|entry| entry.session.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close the upstream of one session.
    ///
    /// The entry stays until the relay loop that owns the session notices and
    /// finishes its own teardown.
    pub async fn terminate(&self, id: Uuid) -> bool {
        let upstream = match self.sessions.read().await.get(&id) {
            Some(entry) => entry.upstream.clone(),
            None => return false,
        };
        if let Some(upstream) = upstream {
            upstream.close().await;
        }
        info!(session_id = %id, "Session terminated");
        true
    }

    /// Close every registered upstream. Used on process shutdown.
    pub async fn close_all(&self) -> usize {
        let upstreams: Vec<Arc<UpstreamSession>> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|entry| entry.upstream.clone())
            .collect();
        let count = upstreams.len();
        for upstream in upstreams {
            upstream.close().await;
        }
        count
    }
}
