//! Session state machine.
//!
//! A [`Session`] owns one [`SandboxPair`] and notifies its observers, its
//! keyboard and the controller on every state transition, in that order,
//! before the transition returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::pool::WorkerPool;
use crate::sandbox::{SandboxEndpoints, SandboxPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one client connection (keyboard, observer or list watcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Failed,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The serialized view of a session exchanged with list watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub kb: bool,
}

/// What observers see on each notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub summary: SessionSummary,
    /// Present exactly when the session is running.
    pub endpoints: Option<SandboxEndpoints>,
}

impl SessionSnapshot {
    pub fn id(&self) -> SessionId {
        self.summary.id
    }

    pub fn state(&self) -> SessionState {
        self.summary.state
    }
}

/// Capability to be told about session state changes.
///
/// Implementations must not call back into the session that notifies them.
pub trait SessionObserver: Send + Sync {
    fn on_session_state_change(&self, session: &SessionSnapshot);
}

struct Inner {
    state: SessionState,
    keyboard: Option<Arc<dyn SessionObserver>>,
    observers: Vec<(ClientId, Arc<dyn SessionObserver>)>,
    endpoints: Option<SandboxEndpoints>,
}

/// A session moved to starting whose sandbox has not been provisioned yet.
///
/// Holds the sandbox lock, so no stop can run until it is provisioned.
pub struct StartClaim {
    pair: OwnedMutexGuard<SandboxPair>,
}

pub struct Session {
    id: SessionId,
    hostname: String,
    inner: Mutex<Inner>,
    /// Held for the whole of a start or stop, so they never overlap.
    sandbox: Arc<tokio::sync::Mutex<SandboxPair>>,
    pool: WorkerPool,
    controller: Weak<dyn SessionObserver>,
}

impl Session {
    pub fn new(
        id: SessionId,
        hostname: impl Into<String>,
        sandbox: SandboxPair,
        pool: WorkerPool,
        controller: Weak<dyn SessionObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            hostname: hostname.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                keyboard: None,
                observers: Vec::new(),
                endpoints: None,
            }),
            sandbox: Arc::new(tokio::sync::Mutex::new(sandbox)),
            pool,
            controller,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn summary(&self) -> SessionSummary {
        Self::summary_of(self.id, &self.lock())
    }

    /// Sandbox endpoints; `None` unless running.
    #[cfg(test)]
    pub fn endpoints(&self) -> Option<SandboxEndpoints> {
        self.lock().endpoints.clone()
    }

    /// Attach or detach the keyboard, re-broadcasting the current state so
    /// everyone sees the new keyboard flag.
    pub fn set_keyboard(&self, keyboard: Option<Arc<dyn SessionObserver>>) {
        let mut inner = self.lock();
        inner.keyboard = keyboard;
        let state = inner.state;
        self.transition(&mut inner, state);
    }

    /// Register an observer and replay the current state to it.
    pub fn add_observer(&self, client: ClientId, observer: Arc<dyn SessionObserver>) {
        let mut inner = self.lock();
        let snapshot = Self::snapshot_of(self.id, &inner);
        inner.observers.push((client, observer.clone()));
        observer.on_session_state_change(&snapshot);
    }

    /// Returns whether `client` was registered.
    pub fn remove_observer(&self, client: ClientId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(id, _)| *id != client);
        inner.observers.len() != before
    }

    /// Provision the sandbox pair.
    ///
    /// # Panics
    ///
    /// If the session is not idle.
    #[cfg(test)]
    pub async fn start(&self) -> Result<(), SessionError> {
        match self.start_if_idle().await {
            Some(result) => result,
            None => panic!(
                "start() called on session {} in state {}",
                self.id,
                self.state()
            ),
        }
    }

    /// Start the session if it is idle once any in-flight stop has finished.
    ///
    /// Returns `None` without waiting when a start is already in flight or
    /// done, and `None` if another caller won the race to start it.
    pub async fn start_if_idle(&self) -> Option<Result<(), SessionError>> {
        if matches!(self.state(), SessionState::Starting | SessionState::Running) {
            return None;
        }
        let pair = self.sandbox.clone().lock_owned().await;
        let claim = self.claim_start(pair)?;
        Some(self.provision(claim).await)
    }

    /// Move an idle session to starting without waiting.
    ///
    /// Returns `None` if the session is not idle or a stop still holds the
    /// sandbox. The returned claim must be handed to [`Session::provision`].
    pub fn try_claim_start(&self) -> Option<StartClaim> {
        let pair = self.sandbox.clone().try_lock_owned().ok()?;
        self.claim_start(pair)
    }

    /// Provision the sandbox pair of a claimed start.
    pub async fn provision(&self, claim: StartClaim) -> Result<(), SessionError> {
        info!(session_id = %self.id, hostname = %self.hostname, "Starting session");

        let hostname = self.hostname.clone();
        let outcome = self
            .pool
            .dispatch(async move {
                let mut pair = claim.pair;
                let result = pair.start(&hostname).await;
                (pair, result)
            })
            .await;

        let mut inner = self.lock();
        match outcome {
            Ok((pair, Ok(()))) => {
                inner.endpoints = pair.endpoints().cloned();
                self.transition(&mut inner, SessionState::Running);
                Ok(())
            }
            Ok((_pair, Err(source))) => {
                self.fail(&mut inner);
                Err(SessionError::Provisioning {
                    id: self.id,
                    source,
                })
            }
            Err(source) => {
                self.fail(&mut inner);
                Err(SessionError::Dispatch {
                    id: self.id,
                    source,
                })
            }
        }
    }

    /// Tear the sandbox pair down. Always ends idle; teardown errors are
    /// logged, not returned.
    pub async fn stop(&self) {
        // Waits for an in-flight start to finish first.
        let pair = self.sandbox.clone().lock_owned().await;
        self.change_state(SessionState::Stopping);
        info!(session_id = %self.id, "Stopping session");

        let outcome = self
            .pool
            .dispatch(async move {
                let mut pair = pair;
                let result = pair.stop().await;
                (pair, result)
            })
            .await;

        // Keep the pair locked until idle is announced so a waiting start
        // sees the final state.
        let _pair = match outcome {
            Ok((pair, result)) => {
                if let Err(e) = result {
                    warn!(session_id = %self.id, error = %e, "Session teardown failed");
                }
                Some(pair)
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Session teardown did not complete");
                None
            }
        };
        self.change_state(SessionState::Idle);
    }

    fn claim_start(&self, pair: OwnedMutexGuard<SandboxPair>) -> Option<StartClaim> {
        let mut inner = self.lock();
        if inner.state != SessionState::Idle {
            return None;
        }
        self.transition(&mut inner, SessionState::Starting);
        Some(StartClaim { pair })
    }

    fn fail(&self, inner: &mut Inner) {
        self.transition(inner, SessionState::Failed);
        self.transition(inner, SessionState::Idle);
    }

    fn change_state(&self, state: SessionState) {
        let mut inner = self.lock();
        self.transition(&mut inner, state);
    }

    fn transition(&self, inner: &mut Inner, state: SessionState) {
        inner.state = state;
        if state != SessionState::Running {
            inner.endpoints = None;
        }
        debug!(session_id = %self.id, state = %state, "Session state change");

        let snapshot = Self::snapshot_of(self.id, inner);
        for (_, observer) in &inner.observers {
            observer.on_session_state_change(&snapshot);
        }
        if let Some(keyboard) = &inner.keyboard {
            keyboard.on_session_state_change(&snapshot);
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.on_session_state_change(&snapshot);
        }
    }

    fn summary_of(id: SessionId, inner: &Inner) -> SessionSummary {
        SessionSummary {
            id,
            state: inner.state,
            kb: inner.keyboard.is_some(),
        }
    }

    fn snapshot_of(id: SessionId, inner: &Inner) -> SessionSnapshot {
        SessionSnapshot {
            summary: Self::summary_of(id, inner),
            endpoints: inner.endpoints.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.inner.get_mut().map(|i| i.state).unwrap_or(SessionState::Idle);
        if state != SessionState::Idle {
            warn!(session_id = %self.id, state = %state, "Destroying non-idle session");
        }
    }
}
