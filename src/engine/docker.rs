//! Docker engine client built on bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tracing::debug;

use super::{ContainerDetails, Engine, WorkloadSpec};
use crate::error::EngineResult;

/// Grace period before Docker kills a stopping container.
const STOP_TIMEOUT_SECS: i64 = 10;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn container_config(spec: &WorkloadSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.published_ports {
        exposed_ports.insert(port.to_string(), HashMap::new());
        // No host port: the engine picks an ephemeral one.
        port_bindings.insert(
            port.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );
    }

    let binds: Vec<String> = spec
        .read_only_mounts
        .iter()
        .map(|(host, container)| format!("{}:{}:ro", host.display(), container))
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        network_mode: Some(spec.network.clone()),
        binds: if binds.is_empty() { None } else { Some(binds) },
        shm_size: spec.shm_size,
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn create_network(&self, name: &str) -> EngineResult<()> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn run_container(&self, spec: &WorkloadSpec) -> EngineResult<String> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config(spec))
            .await?;
        self.docker
            .start_container::<String>(&response.id, None)
            .await?;
        debug!(container = %response.id, image = %spec.image, "Container started");
        Ok(response.id)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let hostname = info
            .config
            .and_then(|c| c.hostname)
            .unwrap_or_default();

        let mut ports = HashMap::new();
        let bindings = info.network_settings.and_then(|n| n.ports).unwrap_or_default();
        for (name, binding) in bindings {
            let host_port = binding
                .unwrap_or_default()
                .into_iter()
                .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()));
            if let Some(port) = host_port {
                ports.insert(name, port);
            }
        }

        Ok(ContainerDetails { hostname, ports })
    }

    async fn exec_output(&self, id: &str, cmd: &[String]) -> EngineResult<String> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk?.to_string());
            }
        }
        Ok(output)
    }

    async fn container_logs(&self, id: &str) -> EngineResult<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk?.to_string());
        }
        Ok(output)
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
