//! Registry of live call sessions

use super::call_session::{CallSession, SessionInfo};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, CallSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, CallSession>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, session: CallSession) {
        let mut sessions = self.lock();
        sessions.insert(session.id(), session);
        gauge!("voxrelay_active_sessions").set(sessions.len() as f64);
    }

    pub fn remove(&self, id: Uuid) -> Option<CallSession> {
        let mut sessions = self.lock();
        let removed = sessions.remove(&id);
        gauge!("voxrelay_active_sessions").set(sessions.len() as f64);
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<CallSession> {
        self.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<CallSession> {
        self.lock().values().cloned().collect()
    }

    /// Monitoring snapshot, oldest session first
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.all().iter().map(CallSession::info).collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Push a language list to every live session
    pub async fn broadcast_language_codes(&self, codes: &[String]) {
        for session in self.all() {
            session.set_language_codes(codes).await;
        }
    }
}
