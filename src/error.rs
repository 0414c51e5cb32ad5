//! Error types for the engine, sandbox, session and controller layers.

use thiserror::Error;

use crate::session::SessionId;

/// Failure talking to the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure creating or destroying a sandbox pair.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to {stage}: {source}")]
    Engine {
        stage: &'static str,
        #[source]
        source: EngineError,
    },
    #[error("{workload} never became ready after {attempts} attempts")]
    NotReady {
        workload: &'static str,
        attempts: u32,
    },
    #[error("{workload} has no host binding for {port}")]
    MissingPort {
        workload: &'static str,
        port: &'static str,
    },
}

impl SandboxError {
    pub(crate) fn engine(stage: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| SandboxError::Engine { stage, source }
    }
}

/// Failure dispatching a job onto the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool closed")]
    Closed,
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to start session {id}: {source}")]
    Provisioning {
        id: SessionId,
        #[source]
        source: SandboxError,
    },
    #[error("lifecycle job for session {id} did not complete: {source}")]
    Dispatch {
        id: SessionId,
        #[source]
        source: PoolError,
    },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown session {0}")]
    SessionNotFound(SessionId),
    #[error(transparent)]
    Session(#[from] SessionError),
}
