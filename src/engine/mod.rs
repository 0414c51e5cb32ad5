//! Container engine client.
//!
//! The sandbox layer talks to the engine only through [`Engine`], so the
//! Docker client can be swapped for [`SimulatedEngine`] in tests and local
//! development.

mod docker;
mod simulated;

pub use docker::DockerEngine;
pub use simulated::SimulatedEngine;
#[cfg(test)]
pub use simulated::{EngineCall, FailPoint};

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::EngineResult;

/// A container to create and start.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSpec {
    pub image: String,
    /// Network the container joins.
    pub network: String,
    /// Container ports (e.g. `22/tcp`) published on an ephemeral host port.
    pub published_ports: Vec<&'static str>,
    /// `(host path, container path)` pairs mounted read-only.
    pub read_only_mounts: Vec<(PathBuf, String)>,
    pub shm_size: Option<i64>,
}

/// What the engine reports about a created container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    /// The container's hostname on its own network.
    pub hostname: String,
    /// Host ports keyed by container port name.
    pub ports: HashMap<String, u16>,
}

impl ContainerDetails {
    pub fn host_port(&self, port: &str) -> Option<u16> {
        self.ports.get(port).copied()
    }
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn ping(&self) -> EngineResult<()>;

    async fn create_network(&self, name: &str) -> EngineResult<()>;

    async fn remove_network(&self, name: &str) -> EngineResult<()>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, spec: &WorkloadSpec) -> EngineResult<String>;

    /// Inspect a container. Host ports are only known once this succeeds
    /// after creation.
    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails>;

    /// Run a command inside the container and collect its output.
    async fn exec_output(&self, id: &str, cmd: &[String]) -> EngineResult<String>;

    async fn container_logs(&self, id: &str) -> EngineResult<String>;

    async fn stop_container(&self, id: &str) -> EngineResult<()>;

    async fn remove_container(&self, id: &str) -> EngineResult<()>;
}
