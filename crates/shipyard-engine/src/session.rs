//! Session identity, the per-session client cache, and the known instance.
//!
//! All three live under one lock so a client is never handed out for a
//! session that has already been rotated away. When a state store is
//! attached, every change is written through; store failures are logged
//! and otherwise ignored.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use shipyard_core::deployment::{InstanceRef, Session};
use shipyard_core::ids::{InstanceId, SessionId};
use shipyard_core::sandbox::{SandboxClient, SandboxClientFactory};
use shipyard_store::DeploymentStateRepo;

struct SessionState {
    session: Session,
    client: Option<Arc<dyn SandboxClient>>,
    instance: Option<InstanceRef>,
}

struct StateSink {
    repo: DeploymentStateRepo,
    project: String,
}

pub struct SessionIdentity {
    factory: Arc<dyn SandboxClientFactory>,
    state: Mutex<SessionState>,
    sink: Option<StateSink>,
}

impl SessionIdentity {
    pub fn new(factory: Arc<dyn SandboxClientFactory>) -> Self {
        Self::from_parts(factory, Session::new(), None, None)
    }

    /// Restore the project's last session and instance, or start (and
    /// record) a fresh session if nothing usable is stored.
    pub fn restore(
        factory: Arc<dyn SandboxClientFactory>,
        repo: DeploymentStateRepo,
        project: impl Into<String>,
    ) -> Self {
        let project = project.into();
        let stored = match repo.get(&project) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(project = %project, error = %e, "failed to load deployment state, starting fresh");
                None
            }
        };

        let sink = StateSink { repo, project };
        match stored {
            Some(state) => {
                info!(
                    session_id = %state.session.session_id,
                    instance_id = ?state.instance.as_ref().map(|i| i.instance_id.as_str()),
                    "restored deployment state"
                );
                Self::from_parts(factory, state.session, state.instance, Some(sink))
            }
            None => {
                let session = Session::new();
                sink.session_changed(&session);
                Self::from_parts(factory, session, None, Some(sink))
            }
        }
    }

    fn from_parts(
        factory: Arc<dyn SandboxClientFactory>,
        session: Session,
        instance: Option<InstanceRef>,
        sink: Option<StateSink>,
    ) -> Self {
        Self {
            factory,
            state: Mutex::new(SessionState {
                session,
                client: None,
                instance,
            }),
            sink,
        }
    }

    pub fn session(&self) -> Session {
        self.state.lock().session.clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.state.lock().session.session_id.clone()
    }

    /// The client for the current session, built on first use after
    /// construction or rotation. Returned with the session it belongs to.
    pub fn client(&self) -> (SessionId, Arc<dyn SandboxClient>) {
        let mut state = self.state.lock();
        let session_id = state.session.session_id.clone();
        let client = match &state.client {
            Some(client) => Arc::clone(client),
            None => {
                debug!(session_id = %session_id, "building sandbox client");
                let client = self.factory.create(&session_id);
                state.client = Some(Arc::clone(&client));
                client
            }
        };
        (session_id, client)
    }

    /// Replace the session, dropping its client and instance.
    /// Returns `(previous, current)`.
    pub fn rotate(&self) -> (SessionId, SessionId) {
        let mut state = self.state.lock();
        let next = Session::new();
        let previous = std::mem::replace(&mut state.session, next.clone()).session_id;
        state.client = None;
        state.instance = None;
        if let Some(sink) = &self.sink {
            sink.session_changed(&next);
        }
        info!(previous = %previous, current = %next.session_id, "session rotated");
        (previous, next.session_id)
    }

    pub fn instance(&self) -> Option<InstanceRef> {
        self.state.lock().instance.clone()
    }

    /// Record `instance` only if `session_id` is still the live session.
    pub fn set_instance_if(&self, session_id: &SessionId, instance: InstanceRef) -> bool {
        let mut state = self.state.lock();
        if &state.session.session_id != session_id {
            debug!(
                expected = %session_id,
                current = %state.session.session_id,
                "session changed, discarding instance"
            );
            return false;
        }
        if let Some(sink) = &self.sink {
            sink.instance_changed(Some(&instance));
        }
        state.instance = Some(instance);
        true
    }

    /// Clear the known instance only if it is still `instance_id`.
    pub fn clear_instance_if(&self, instance_id: &InstanceId) -> bool {
        let mut state = self.state.lock();
        if state.instance.as_ref().map(|i| &i.instance_id) != Some(instance_id) {
            return false;
        }
        state.instance = None;
        if let Some(sink) = &self.sink {
            sink.instance_changed(None);
        }
        true
    }

    pub fn clear_instance(&self) {
        let mut state = self.state.lock();
        if state.instance.take().is_some() {
            if let Some(sink) = &self.sink {
                sink.instance_changed(None);
            }
        }
    }
}

impl StateSink {
    fn session_changed(&self, session: &Session) {
        if let Err(e) = self.repo.save_session(&self.project, session) {
            warn!(project = %self.project, error = %e, "failed to persist session");
        }
    }

    fn instance_changed(&self, instance: Option<&InstanceRef>) {
        if let Err(e) = self.repo.save_instance(&self.project, instance) {
            warn!(project = %self.project, error = %e, "failed to persist instance");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_sandbox::{MockFactory, MockSandbox};
    use shipyard_store::Database;

    fn identity() -> (SessionIdentity, MockFactory) {
        let factory = MockFactory::new(MockSandbox::new());
        (SessionIdentity::new(Arc::new(factory.clone())), factory)
    }

    fn instance(id: &str) -> InstanceRef {
        InstanceRef {
            instance_id: InstanceId::from_raw(id),
            preview_url: Some(format!("https://{id}.preview")),
            tunnel_url: None,
        }
    }

    #[test]
    fn client_is_memoized_per_session() {
        let (identity, factory) = identity();
        let (s1, c1) = identity.client();
        let (s2, c2) = identity.client();
        assert_eq!(s1, s2);
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(factory.sessions().len(), 1);
    }

    #[test]
    fn rotate_replaces_session_client_and_instance() {
        let (identity, factory) = identity();
        let (before, c1) = identity.client();
        assert!(identity.set_instance_if(&before, instance("run-1")));

        let (previous, current) = identity.rotate();
        assert_eq!(previous, before);
        assert_ne!(current, before);
        assert!(identity.instance().is_none());

        let (after, c2) = identity.client();
        assert_eq!(after, current);
        assert!(!Arc::ptr_eq(&c1, &c2));
        assert_eq!(factory.sessions(), vec![before, current]);
    }

    #[test]
    fn stale_session_cannot_record_instance() {
        let (identity, _) = identity();
        let stale = identity.session_id();
        identity.rotate();
        assert!(!identity.set_instance_if(&stale, instance("run-1")));
        assert!(identity.instance().is_none());
    }

    #[test]
    fn clear_instance_if_only_clears_the_named_instance() {
        let (identity, _) = identity();
        let session_id = identity.session_id();
        assert!(identity.set_instance_if(&session_id, instance("run-2")));

        assert!(!identity.clear_instance_if(&InstanceId::from_raw("run-1")));
        assert_eq!(identity.instance(), Some(instance("run-2")));

        assert!(identity.clear_instance_if(&InstanceId::from_raw("run-2")));
        assert!(identity.instance().is_none());
    }

    #[test]
    fn restore_roundtrips_through_store() {
        let db = Database::in_memory().unwrap();
        let factory: Arc<dyn SandboxClientFactory> = Arc::new(MockFactory::new(MockSandbox::new()));

        let first = SessionIdentity::restore(Arc::clone(&factory), DeploymentStateRepo::new(db.clone()), "demo");
        let session_id = first.session_id();
        assert!(first.set_instance_if(&session_id, instance("run-5")));
        drop(first);

        let second = SessionIdentity::restore(Arc::clone(&factory), DeploymentStateRepo::new(db.clone()), "demo");
        assert_eq!(second.session_id(), session_id);
        assert_eq!(second.instance(), Some(instance("run-5")));

        second.clear_instance();
        let (_, rotated) = second.rotate();
        let stored = DeploymentStateRepo::new(db).get("demo").unwrap().unwrap();
        assert_eq!(stored.session.session_id, rotated);
        assert!(stored.instance.is_none());
    }
}
