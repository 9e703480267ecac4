use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use parley_protocol::{BrokerError, BrokerResult, SessionId};

use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub history_cap: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { history_cap: 200 }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    order: Vec<SessionId>,
    focused: Option<SessionId>,
    counter: u64,
}

/// Process-wide session map with focus arbitration and tab navigation.
/// The registry lock is held only to mutate the maps; session locks are
/// always taken after it, never before.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    fn read(&self) -> BrokerResult<RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| BrokerError::Internal("session registry lock poisoned".to_owned()))
    }

    fn write(&self) -> BrokerResult<RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| BrokerError::Internal("session registry lock poisoned".to_owned()))
    }

    /// Idempotent lookup-or-create. The first session to appear is focused
    /// automatically; new sessions get an "Agent N" name until renamed.
    pub fn get_or_create(&self, id: &SessionId) -> BrokerResult<(Arc<Session>, bool)> {
        let mut inner = self.write()?;
        if let Some(session) = inner.sessions.get(id) {
            return Ok((Arc::clone(session), false));
        }

        inner.counter += 1;
        let name = format!("Agent {}", inner.counter);
        let session = Arc::new(Session::new(id.clone(), name, self.config.history_cap));
        inner.sessions.insert(id.clone(), Arc::clone(&session));
        inner.order.push(id.clone());
        if inner.focused.is_none() {
            inner.focused = Some(id.clone());
        }
        Ok((session, true))
    }

    pub fn get(&self, id: &SessionId) -> BrokerResult<Arc<Session>> {
        self.read()?
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::SessionNotFound(id.as_str().to_owned()))
    }

    pub fn try_get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.read().ok()?.sessions.get(id).cloned()
    }

    /// Remove a session slot. If it was focused, focus moves to the next
    /// session in tab order. Returns the removed session so the caller can
    /// cancel its pending items.
    pub fn remove(&self, id: &SessionId) -> BrokerResult<Option<Arc<Session>>> {
        let mut inner = self.write()?;
        let Some(session) = inner.sessions.remove(id) else {
            return Ok(None);
        };
        inner.order.retain(|other| other != id);
        if inner.focused.as_ref() == Some(id) {
            inner.focused = inner.order.first().cloned();
        }
        Ok(Some(session))
    }

    pub fn focus(&self, id: &SessionId) -> BrokerResult<Arc<Session>> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::SessionNotFound(id.as_str().to_owned()))?;
        inner.focused = Some(id.clone());
        Ok(session)
    }

    pub fn focused(&self) -> Option<Arc<Session>> {
        let inner = self.read().ok()?;
        inner
            .focused
            .as_ref()
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    pub fn focused_id(&self) -> Option<SessionId> {
        self.read().ok()?.focused.clone()
    }

    pub fn is_focused(&self, id: &SessionId) -> bool {
        self.focused_id().as_ref() == Some(id)
    }

    pub fn next_tab(&self) -> Option<Arc<Session>> {
        self.cycle(1)
    }

    pub fn prev_tab(&self) -> Option<Arc<Session>> {
        self.cycle(-1)
    }

    fn cycle(&self, step: isize) -> Option<Arc<Session>> {
        let mut inner = self.write().ok()?;
        if inner.order.is_empty() {
            return None;
        }
        let current = inner
            .focused
            .as_ref()
            .and_then(|id| inner.order.iter().position(|other| other == id))
            .unwrap_or(0);
        let len = inner.order.len() as isize;
        let next = (current as isize + step).rem_euclid(len) as usize;
        let id = inner.order[next].clone();
        inner.focused = Some(id.clone());
        inner.sessions.get(&id).cloned()
    }

    /// Cycle focus to the next session with a pending or active choices item.
    pub fn next_with_pending(&self) -> Option<Arc<Session>> {
        let mut inner = self.write().ok()?;
        if inner.order.is_empty() {
            return None;
        }
        let start = inner
            .focused
            .as_ref()
            .and_then(|id| inner.order.iter().position(|other| other == id))
            .unwrap_or(0);
        let len = inner.order.len();
        for offset in 1..=len {
            let id = inner.order[(start + offset) % len].clone();
            let Some(session) = inner.sessions.get(&id).cloned() else {
                continue;
            };
            if session.queued_choice_count().unwrap_or(0) > 0 {
                inner.focused = Some(id);
                return Some(session);
            }
        }
        None
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let Ok(inner) = self.read() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions eligible for pruning: idle past the timeout, empty inbox, and
    /// not focused. A session holding an unresolved item is never a candidate.
    pub fn stale_candidates(&self, max_idle: Duration) -> Vec<SessionId> {
        let Ok(inner) = self.read() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter(|id| inner.focused.as_ref() != Some(*id))
            .filter_map(|id| inner.sessions.get(id).map(|session| (id, session)))
            .filter(|(_, session)| {
                session.inbox_is_empty().unwrap_or(false)
                    && session.idle_for().map(|idle| idle > max_idle).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_protocol::SessionId;

    use super::{RegistryConfig, SessionRegistry};

    #[test]
    fn get_or_create_is_idempotent_and_auto_names() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let id = SessionId::new("sess-a");

        let (first, created) = registry.get_or_create(&id).expect("create session");
        assert!(created);
        assert_eq!(first.display_name().expect("name"), "Agent 1");

        let (second, created_again) = registry.get_or_create(&id).expect("lookup session");
        assert!(!created_again);
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn first_session_is_focused_and_removal_refocuses() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let id_a = SessionId::new("sess-a");
        let id_b = SessionId::new("sess-b");

        registry.get_or_create(&id_a).expect("create a");
        registry.get_or_create(&id_b).expect("create b");
        assert_eq!(registry.focused_id(), Some(id_a.clone()));

        registry.remove(&id_a).expect("remove a");
        assert_eq!(registry.focused_id(), Some(id_b));
        assert!(registry.remove(&id_a).expect("second remove").is_none());
    }

    #[test]
    fn tab_cycling_wraps_in_creation_order() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let ids: Vec<SessionId> = ["sess-a", "sess-b", "sess-c"]
            .iter()
            .map(|id| SessionId::new(*id))
            .collect();
        for id in &ids {
            registry.get_or_create(id).expect("create session");
        }

        let next = registry.next_tab().expect("next tab");
        assert_eq!(next.id, ids[1]);
        let next = registry.next_tab().expect("next tab");
        assert_eq!(next.id, ids[2]);
        let next = registry.next_tab().expect("next tab wraps");
        assert_eq!(next.id, ids[0]);
        let prev = registry.prev_tab().expect("prev tab wraps");
        assert_eq!(prev.id, ids[2]);
    }

    #[test]
    fn stale_candidates_skip_focused_sessions() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let id_a = SessionId::new("sess-a");
        let id_b = SessionId::new("sess-b");
        registry.get_or_create(&id_a).expect("create a");
        registry.get_or_create(&id_b).expect("create b");

        // Zero timeout: everything idle counts except the focused session.
        let candidates = registry.stale_candidates(Duration::from_secs(0));
        assert_eq!(candidates, vec![id_b]);
    }
}
