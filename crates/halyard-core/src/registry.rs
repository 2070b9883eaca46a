//! Shared session store: the by-id index (resume) and the by-user index
//! (multi-device fan-out). Mutated concurrently from many connection
//! tasks; nothing outside this module touches the underlying maps.

use dashmap::DashMap;
use std::sync::Arc;

use halyard_models::presence::Presence;

use crate::client_caps::public_status;
use crate::session::{Session, SessionId, SessionKind};

#[derive(Default)]
pub struct SessionRegistry {
    by_id: DashMap<SessionId, Arc<Session>>,
    by_user: DashMap<i64, Vec<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.by_user
            .entry(session.user_id)
            .or_default()
            .push(session.clone());
        self.by_id.insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.by_id.get(session_id).map(|s| s.clone())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.by_id.remove(session_id)?;
        if let Some(mut sessions) = self.by_user.get_mut(&session.user_id) {
            sessions.retain(|s| s.id != session_id);
        }
        self.by_user
            .remove_if(&session.user_id, |_, sessions| sessions.is_empty());
        Some(session)
    }

    pub fn sessions_for_user(&self, user_id: i64) -> Vec<Arc<Session>> {
        self.by_user
            .get(&user_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Gateway sessions currently able to receive events.
    pub fn live_sessions_for_user(&self, user_id: i64) -> Vec<Arc<Session>> {
        self.sessions_for_user(user_id)
            .into_iter()
            .filter(|s| s.kind == SessionKind::Gateway && !s.is_dead())
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.by_id.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The presence other users observe for this account: the
    /// most-recently-active live gateway session's presence, offline when
    /// none remain. Invisible never leaks.
    pub fn visible_presence(&self, user_id: i64) -> Presence {
        let mut best: Option<Arc<Session>> = None;
        for session in self.live_sessions_for_user(user_id) {
            if !session.is_ready() {
                continue;
            }
            let newer = match &best {
                Some(current) => session.last_active() > current.last_active(),
                None => true,
            };
            if newer {
                best = Some(session);
            }
        }
        match best {
            Some(session) => {
                let mut presence = session.presence();
                presence.status = public_status(presence.status);
                presence
            }
            None => Presence::offline(user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_caps::ClientCapabilities;
    use halyard_models::intents::Intents;
    use halyard_models::presence::Status;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_session(user_id: i64, kind: SessionKind) -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(
            user_id,
            kind,
            Intents::default_for_user(),
            ClientCapabilities::default(),
            vec![],
            tx,
            500,
        ));
        session.mark_ready(json!({}));
        session
    }

    #[tokio::test]
    async fn test_insert_and_lookup_both_indices() {
        let registry = SessionRegistry::new();
        let a = make_session(1, SessionKind::Gateway);
        let b = make_session(1, SessionKind::Gateway);
        registry.insert(a.clone());
        registry.insert(b.clone());

        assert!(registry.get(&a.id).is_some());
        assert_eq!(registry.sessions_for_user(1).len(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_clears_both_indices() {
        let registry = SessionRegistry::new();
        let a = make_session(1, SessionKind::Gateway);
        registry.insert(a.clone());
        registry.remove(&a.id);
        assert!(registry.get(&a.id).is_none());
        assert!(registry.sessions_for_user(1).is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_live_sessions_exclude_dead_and_voice() {
        let registry = SessionRegistry::new();
        let gateway = make_session(1, SessionKind::Gateway);
        let voice = make_session(1, SessionKind::Voice);
        let dead = make_session(1, SessionKind::Gateway);
        dead.mark_closed();
        registry.insert(gateway.clone());
        registry.insert(voice);
        registry.insert(dead);

        let live = registry.live_sessions_for_user(1);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, gateway.id);
    }

    #[tokio::test]
    async fn test_visible_presence_promotes_most_recent() {
        let registry = SessionRegistry::new();
        let older = make_session(1, SessionKind::Gateway);
        older.set_presence(Status::Dnd, vec![]);
        registry.insert(older);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = make_session(1, SessionKind::Gateway);
        newer.set_presence(Status::Idle, vec![]);
        newer.touch();
        registry.insert(newer);

        assert_eq!(registry.visible_presence(1).status, Status::Idle);
    }

    #[tokio::test]
    async fn test_visible_presence_offline_when_no_sessions() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.visible_presence(9).status, Status::Offline);
    }

    #[tokio::test]
    async fn test_visible_presence_never_shows_invisible() {
        let registry = SessionRegistry::new();
        let session = make_session(1, SessionKind::Gateway);
        session.set_presence(Status::Invisible, vec![]);
        registry.insert(session);
        assert_eq!(registry.visible_presence(1).status, Status::Offline);
    }
}
