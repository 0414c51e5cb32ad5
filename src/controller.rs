//! Registry of live sessions and the clients attached to them.
//!
//! A session stays registered while at least one keyboard or observer is
//! attached to it, or while it is being provisioned. When the last attachment
//! leaves, the session is stopped and removed.
//!
//! Lock order is session state first, then the registry: sessions notify the
//! controller while holding their own lock, so nothing here calls into a
//! session while the registry is locked. Summaries are cached per session for
//! that reason.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, info};

use crate::config::SandboxConfig;
use crate::engine::Engine;
use crate::error::ControllerError;
use crate::pool::WorkerPool;
use crate::sandbox::SandboxPair;
use crate::session::{
    ClientId, Session, SessionId, SessionObserver, SessionSnapshot, SessionState, SessionSummary,
};

/// Subscriber to lifecycle events of every session.
pub trait ListWatcher: Send + Sync {
    fn on_session_add(&self, session: &SessionSummary);
    fn on_session_remove(&self, session: &SessionSummary);
    fn on_session_state_change(&self, session: &SessionSummary);
    fn on_keystrokes(&self, session: &SessionSummary);
}

struct Entry {
    session: Arc<Session>,
    summary: SessionSummary,
    attachments: usize,
}

#[derive(Default)]
struct Registry {
    sessions: BTreeMap<SessionId, Entry>,
    keyboards: HashMap<ClientId, SessionId>,
    observers: HashMap<ClientId, SessionId>,
    list_watchers: Vec<(ClientId, Arc<dyn ListWatcher>)>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>, summary: SessionSummary) {
        for (_, watcher) in &self.list_watchers {
            watcher.on_session_add(&summary);
        }
        self.sessions.insert(
            summary.id,
            Entry {
                session,
                summary,
                attachments: 0,
            },
        );
    }

    fn attach(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let entry = self.sessions.get_mut(&id)?;
        entry.attachments += 1;
        Some(entry.session.clone())
    }

    fn detach(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let entry = self.sessions.get_mut(&id)?;
        entry.attachments = entry.attachments.saturating_sub(1);
        Some(entry.session.clone())
    }

    fn is_attached(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .map_or(false, |entry| entry.attachments > 0)
    }

    fn remove(&mut self, id: SessionId) -> Option<Entry> {
        let entry = self.sessions.remove(&id)?;
        for (_, watcher) in &self.list_watchers {
            watcher.on_session_remove(&entry.summary);
        }
        Some(entry)
    }
}

struct Shared {
    engine: Arc<dyn Engine>,
    config: Arc<SandboxConfig>,
    pool: WorkerPool,
    next_session: AtomicU64,
    next_client: AtomicU64,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionObserver for Shared {
    fn on_session_state_change(&self, session: &SessionSnapshot) {
        let mut registry = self.registry();
        let Some(entry) = registry.sessions.get_mut(&session.id()) else {
            return;
        };
        entry.summary = session.summary.clone();
        for (_, watcher) in &registry.list_watchers {
            watcher.on_session_state_change(&session.summary);
        }
    }
}

#[derive(Clone)]
pub struct SessionsController {
    shared: Arc<Shared>,
}

impl SessionsController {
    pub fn new(engine: Arc<dyn Engine>, config: SandboxConfig, pool: WorkerPool) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                config: Arc::new(config),
                pool,
                next_session: AtomicU64::new(1),
                next_client: AtomicU64::new(1),
                registry: Mutex::default(),
            }),
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.shared.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// A new session for `keyboard`, already starting when this returns.
    /// Provisioning runs in the background.
    pub fn keyboard_connected(
        &self,
        client: ClientId,
        keyboard: Arc<dyn SessionObserver>,
        hostname: &str,
    ) -> Arc<Session> {
        let session = self.create_session(hostname);
        session.set_keyboard(Some(keyboard));
        let summary = session.summary();
        {
            let mut registry = self.shared.registry();
            registry.insert(session.clone(), summary);
            registry.attach(session.id());
            registry.keyboards.insert(client, session.id());
        }
        info!(client = client.0, session_id = %session.id(), "Keyboard connected");

        // Claimed before returning, so a disconnect that races provisioning
        // finds the session starting and leaves its release to the task.
        let Some(claim) = session.try_claim_start() else {
            return session;
        };
        let controller = self.clone();
        let provisioning = session.clone();
        tokio::spawn(async move {
            if let Err(e) = provisioning.provision(claim).await {
                error!(error = %e, "Keyboard session failed to start");
            }
            controller.release_if_unattached(&provisioning).await;
        });
        session
    }

    pub async fn keyboard_disconnected(&self, client: ClientId) {
        let session = {
            let mut registry = self.shared.registry();
            let Some(id) = registry.keyboards.remove(&client) else {
                return;
            };
            registry.detach(id)
        };
        let Some(session) = session else {
            return;
        };
        info!(client = client.0, session_id = %session.id(), "Keyboard disconnected");
        session.set_keyboard(None);
        self.release_if_unattached(&session).await;
    }

    /// Attach `observer` to session `target`, or to a fresh session when
    /// `target` is `None`, and wait for the session to be provisioned if it
    /// was idle.
    pub async fn start_observation(
        &self,
        client: ClientId,
        observer: Arc<dyn SessionObserver>,
        target: Option<SessionId>,
        hostname: &str,
    ) -> Result<Arc<Session>, ControllerError> {
        let session = match target {
            None => {
                let session = self.create_session(hostname);
                let summary = session.summary();
                let mut registry = self.shared.registry();
                registry.insert(session.clone(), summary);
                registry.attach(session.id());
                registry.observers.insert(client, session.id());
                session
            }
            Some(id) => {
                let mut registry = self.shared.registry();
                let session = registry
                    .attach(id)
                    .ok_or(ControllerError::SessionNotFound(id))?;
                registry.observers.insert(client, id);
                session
            }
        };
        info!(client = client.0, session_id = %session.id(), "Observation started");
        session.add_observer(client, observer);

        let outcome = match session.try_claim_start() {
            Some(claim) => Some(session.provision(claim).await),
            None => session.start_if_idle().await,
        };
        self.release_if_unattached(&session).await;
        match outcome {
            Some(Err(e)) => {
                error!(client = client.0, error = %e, "Observed session failed to start");
                Err(e.into())
            }
            _ => Ok(session),
        }
    }

    pub async fn stop_observation(&self, client: ClientId) {
        let session = {
            let mut registry = self.shared.registry();
            let Some(id) = registry.observers.remove(&client) else {
                return;
            };
            registry.detach(id)
        };
        let Some(session) = session else {
            return;
        };
        info!(client = client.0, session_id = %session.id(), "Observation stopped");
        session.remove_observer(client);
        self.release_if_unattached(&session).await;
    }

    /// Subscribe `watcher`, replaying every current session to it.
    pub fn add_list_watcher(&self, client: ClientId, watcher: Arc<dyn ListWatcher>) {
        let mut registry = self.shared.registry();
        for entry in registry.sessions.values() {
            watcher.on_session_add(&entry.summary);
        }
        registry.list_watchers.push((client, watcher));
        debug!(client = client.0, "List watcher added");
    }

    pub fn remove_list_watcher(&self, client: ClientId) {
        let mut registry = self.shared.registry();
        registry.list_watchers.retain(|(id, _)| *id != client);
        debug!(client = client.0, "List watcher removed");
    }

    pub fn on_keystrokes(&self, session: &Session) {
        let registry = self.shared.registry();
        let Some(entry) = registry.sessions.get(&session.id()) else {
            return;
        };
        for (_, watcher) in &registry.list_watchers {
            watcher.on_keystrokes(&entry.summary);
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.shared
            .registry()
            .sessions
            .values()
            .map(|entry| entry.summary.clone())
            .collect()
    }

    /// Stop and remove every session.
    pub async fn stop(&self) {
        let sessions: Vec<Arc<Session>> = self
            .shared
            .registry()
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        info!(count = sessions.len(), "Stopping all sessions");

        futures_util::future::join_all(sessions.iter().map(|session| session.stop())).await;

        let mut registry = self.shared.registry();
        registry.keyboards.clear();
        registry.observers.clear();
        for session in &sessions {
            registry.remove(session.id());
        }
    }

    fn create_session(&self, hostname: &str) -> Arc<Session> {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        let hook: Weak<Shared> = Arc::downgrade(&self.shared);
        let sandbox = SandboxPair::new(self.shared.engine.clone(), self.shared.config.clone());
        Session::new(id, hostname, sandbox, self.shared.pool.clone(), hook)
    }

    /// Stop and remove `session` if nothing is attached to it anymore.
    ///
    /// A session that is still provisioning is left alone; whoever started
    /// it calls this again once provisioning finishes.
    async fn release_if_unattached(&self, session: &Arc<Session>) {
        let id = session.id();
        if self.shared.registry().is_attached(id) {
            return;
        }
        match session.state() {
            SessionState::Starting => {
                debug!(session_id = %id, "Unattached session still provisioning");
                return;
            }
            SessionState::Idle => {}
            _ => session.stop().await,
        }

        let mut registry = self.shared.registry();
        if !registry.is_attached(id) && registry.remove(id).is_some() {
            info!(session_id = %id, "Session removed");
        }
    }
}
