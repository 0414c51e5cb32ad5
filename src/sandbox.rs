//! Sandbox pair lifecycle: a private network, the primary tidebox workload and
//! the web-terminal gateway in front of it.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{SandboxConfig, MP3_PORT, SSH_PORT, WEBSSH_CONFIG_MOUNT, WEBSSH_PORT};
use crate::engine::{ContainerDetails, Engine, WorkloadSpec};
use crate::error::SandboxError;
use crate::health::wait_until_ready;

const TIDEBOX: &str = "tidebox";
const WEBSSH: &str = "webssh";

/// Client-facing endpoints of a fully started pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoints {
    /// Public hostname used in client URLs.
    pub hostname: String,
    pub ssh_port: u16,
    pub mp3_port: u16,
    pub webssh_port: u16,
    /// The tidebox container's hostname on the private network.
    pub internal_hostname: String,
}

impl SandboxEndpoints {
    pub fn ssh_hostport(&self) -> (&str, u16) {
        (&self.hostname, self.ssh_port)
    }

    pub fn mp3_url(&self) -> String {
        format!("http://{}:{}/stream.mp3", self.hostname, self.mp3_port)
    }

    /// Deep link into the gateway's terminal for the tidebox's SSH daemon.
    pub fn ssh_url(&self) -> String {
        format!(
            "http://{}:{}/ssh/host/{}?port=22",
            self.hostname, self.webssh_port, self.internal_hostname
        )
    }
}

struct Workload {
    id: String,
    details: ContainerDetails,
}

/// One session's compute resources.
///
/// Either nothing is allocated or everything is allocated and health-checked;
/// [`start`](Self::start) rolls back on any failure.
pub struct SandboxPair {
    engine: Arc<dyn Engine>,
    config: Arc<SandboxConfig>,
    network: Option<String>,
    tidebox: Option<Workload>,
    webssh: Option<Workload>,
    endpoints: Option<SandboxEndpoints>,
    cleaned_up: bool,
}

impl SandboxPair {
    pub fn new(engine: Arc<dyn Engine>, config: Arc<SandboxConfig>) -> Self {
        Self {
            engine,
            config,
            network: None,
            tidebox: None,
            webssh: None,
            endpoints: None,
            cleaned_up: true,
        }
    }

    /// Identifier of the pair: the generated name of its private network.
    pub fn id(&self) -> Option<&str> {
        self.network.as_deref()
    }

    /// Endpoints of the running pair; `None` unless fully started.
    pub fn endpoints(&self) -> Option<&SandboxEndpoints> {
        self.endpoints.as_ref()
    }

    /// Provision the network and both workloads, waiting for each to report
    /// ready. On failure everything created so far is released before the
    /// error is returned.
    pub async fn start(&mut self, hostname: &str) -> Result<(), SandboxError> {
        assert!(self.cleaned_up, "sandbox pair started twice without stop");
        self.cleaned_up = false;

        match self.provision(hostname).await {
            Ok(endpoints) => {
                info!(
                    sandbox = self.id().unwrap_or_default(),
                    ssh_port = endpoints.ssh_port,
                    mp3_port = endpoints.mp3_port,
                    webssh_port = endpoints.webssh_port,
                    "Sandbox pair ready"
                );
                self.endpoints = Some(endpoints);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Sandbox pair failed to start, rolling back");
                if let Err(teardown) = self.stop().await {
                    warn!(error = %teardown, "Rollback left resources behind");
                }
                Err(e)
            }
        }
    }

    async fn provision(&mut self, hostname: &str) -> Result<SandboxEndpoints, SandboxError> {
        let engine = self.engine.clone();
        let config = self.config.clone();

        let network = Uuid::new_v4().to_string();
        engine
            .create_network(&network)
            .await
            .map_err(SandboxError::engine("create network"))?;
        self.network = Some(network.clone());
        info!(network = %network, "Created sandbox network");

        let tidebox_id = engine
            .run_container(&WorkloadSpec {
                image: config.tidebox_image.clone(),
                network: network.clone(),
                published_ports: vec![SSH_PORT, MP3_PORT],
                read_only_mounts: Vec::new(),
                shm_size: Some(config.tidebox_shm_bytes),
            })
            .await
            .map_err(SandboxError::engine("start tidebox container"))?;
        // Registered before anything else can fail so stop() releases it.
        self.tidebox = Some(Workload {
            id: tidebox_id.clone(),
            details: ContainerDetails::default(),
        });
        let details = engine
            .inspect_container(&tidebox_id)
            .await
            .map_err(SandboxError::engine("inspect tidebox container"))?;
        self.tidebox = Some(Workload {
            id: tidebox_id.clone(),
            details,
        });
        info!(container = %tidebox_id, "Started tidebox container");
        wait_until_ready(
            engine.as_ref(),
            TIDEBOX,
            &tidebox_id,
            &config.tidebox_probe,
            config.readiness,
        )
        .await?;

        let webssh_id = engine
            .run_container(&WorkloadSpec {
                image: config.webssh_image.clone(),
                network: network.clone(),
                published_ports: vec![WEBSSH_PORT],
                read_only_mounts: vec![(
                    config.webssh_config.clone(),
                    WEBSSH_CONFIG_MOUNT.to_string(),
                )],
                shm_size: None,
            })
            .await
            .map_err(SandboxError::engine("start webssh container"))?;
        self.webssh = Some(Workload {
            id: webssh_id.clone(),
            details: ContainerDetails::default(),
        });
        let details = engine
            .inspect_container(&webssh_id)
            .await
            .map_err(SandboxError::engine("inspect webssh container"))?;
        self.webssh = Some(Workload {
            id: webssh_id.clone(),
            details,
        });
        info!(container = %webssh_id, "Started webssh container");
        wait_until_ready(
            engine.as_ref(),
            WEBSSH,
            &webssh_id,
            &config.webssh_probe,
            config.readiness,
        )
        .await?;

        self.resolve_endpoints(hostname)
    }

    fn resolve_endpoints(&self, hostname: &str) -> Result<SandboxEndpoints, SandboxError> {
        let (Some(tidebox), Some(webssh)) = (&self.tidebox, &self.webssh) else {
            unreachable!("endpoints resolved before both workloads exist");
        };
        let host_port = |workload: &'static str, details: &ContainerDetails, port: &'static str| {
            details
                .host_port(port)
                .ok_or(SandboxError::MissingPort { workload, port })
        };

        Ok(SandboxEndpoints {
            hostname: hostname.to_string(),
            ssh_port: host_port(TIDEBOX, &tidebox.details, SSH_PORT)?,
            mp3_port: host_port(TIDEBOX, &tidebox.details, MP3_PORT)?,
            webssh_port: host_port(WEBSSH, &webssh.details, WEBSSH_PORT)?,
            internal_hostname: tidebox.details.hostname.clone(),
        })
    }

    /// Release the gateway, the tidebox and the network, in that order.
    ///
    /// Idempotent: a second call makes no engine calls. Every allocated
    /// resource is attempted even if an earlier release fails; the first
    /// failure is returned.
    pub async fn stop(&mut self) -> Result<(), SandboxError> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;
        self.endpoints = None;

        let mut first_error = None;

        if let Some(webssh) = self.webssh.take() {
            info!(container = %webssh.id, "Stopping webssh container");
            if let Err(e) = self.release_container(&webssh.id).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(tidebox) = self.tidebox.take() {
            info!(container = %tidebox.id, "Stopping tidebox container");
            if let Err(e) = self.release_container(&tidebox.id).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(network) = self.network.take() {
            info!(network = %network, "Removing sandbox network");
            if let Err(e) = self.engine.remove_network(&network).await {
                warn!(network = %network, error = %e, "Failed to remove network");
                first_error.get_or_insert(SandboxError::Engine {
                    stage: "remove network",
                    source: e,
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn release_container(&self, id: &str) -> Result<(), SandboxError> {
        // Removal is forced, so a failed stop still gets a removal attempt.
        let stopped = self.engine.stop_container(id).await;
        if let Err(e) = &stopped {
            warn!(container = %id, error = %e, "Failed to stop container");
        }
        if let Err(e) = self.engine.remove_container(id).await {
            warn!(container = %id, error = %e, "Failed to remove container (may require manual cleanup)");
            return Err(SandboxError::Engine {
                stage: "remove container",
                source: e,
            });
        }
        stopped.map_err(SandboxError::engine("stop container"))
    }
}

impl Drop for SandboxPair {
    fn drop(&mut self) {
        if !self.cleaned_up {
            warn!(
                sandbox = self.id().unwrap_or("unknown"),
                "Sandbox pair dropped without being stopped, its containers are leaking"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessPolicy;
    use crate::engine::{EngineCall, FailPoint, SimulatedEngine};
    use std::time::Duration;

    fn config() -> SandboxConfig {
        SandboxConfig {
            readiness: ReadinessPolicy {
                attempts: 3,
                interval: Duration::from_millis(10),
            },
            ..SandboxConfig::default()
        }
    }

    fn pair(config: &SandboxConfig) -> (Arc<SimulatedEngine>, SandboxPair) {
        let engine = Arc::new(SimulatedEngine::ready_for(config));
        let pair = SandboxPair::new(engine.clone(), Arc::new(config.clone()));
        (engine, pair)
    }

    #[tokio::test]
    async fn start_exposes_all_endpoints() {
        let config = config();
        let (engine, mut pair) = pair(&config);

        pair.start("tides.example").await.unwrap();

        let endpoints = pair.endpoints().unwrap().clone();
        assert_eq!(endpoints.hostname, "tides.example");
        assert_eq!(
            endpoints.mp3_url(),
            format!("http://tides.example:{}/stream.mp3", endpoints.mp3_port)
        );
        assert_eq!(
            endpoints.ssh_url(),
            format!(
                "http://tides.example:{}/ssh/host/{}?port=22",
                endpoints.webssh_port, endpoints.internal_hostname
            )
        );
        assert_eq!(endpoints.ssh_hostport(), ("tides.example", endpoints.ssh_port));
        assert!(!endpoints.internal_hostname.is_empty());
        assert_eq!(engine.running_containers(), 2);
        assert_eq!(engine.live_networks(), 1);

        pair.stop().await.unwrap();
    }

    #[tokio::test]
    async fn containers_join_the_pair_network() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        pair.start("h").await.unwrap();
        let network = pair.id().unwrap().to_string();

        let networks: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::RunContainer { network, .. } => Some(network),
                _ => None,
            })
            .collect();
        assert_eq!(networks, vec![network.clone(), network]);

        pair.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_gateway_then_tidebox_then_network() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        pair.start("h").await.unwrap();
        let before = engine.calls().len();

        pair.stop().await.unwrap();

        let teardown = engine.calls().split_off(before);
        assert_eq!(teardown.len(), 5);
        assert!(matches!(&teardown[0], EngineCall::StopContainer(id) if id == "000000000002"));
        assert!(matches!(&teardown[2], EngineCall::StopContainer(id) if id == "000000000001"));
        assert!(matches!(teardown[4], EngineCall::RemoveNetwork(_)));
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
        assert!(pair.endpoints().is_none());
    }

    #[tokio::test]
    async fn second_stop_makes_no_engine_calls() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        pair.start("h").await.unwrap();
        pair.stop().await.unwrap();
        let after_first = engine.calls().len();

        pair.stop().await.unwrap();

        assert_eq!(engine.calls().len(), after_first);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        pair.stop().await.unwrap();
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn gateway_launch_failure_rolls_everything_back() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.fail_at(FailPoint::Launch(config.webssh_image.clone()));

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::Engine { stage: "start webssh container", .. }));
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
        assert!(pair.endpoints().is_none());
    }

    #[tokio::test]
    async fn network_failure_creates_nothing() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.fail_at(FailPoint::CreateNetwork);

        assert!(pair.start("h").await.is_err());

        assert_eq!(engine.calls().len(), 1);
        assert_eq!(engine.live_networks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tidebox_that_never_reports_ready_is_torn_down() {
        let config = SandboxConfig::default();
        let (engine, mut pair) = pair(&config);
        engine.set_output(&config.tidebox_image, "supervisord started\n");

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::NotReady { workload: "tidebox", attempts: 30 }));
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
        // The gateway is never launched when the tidebox is not ready.
        assert!(!engine.calls().iter().any(|c| matches!(
            c,
            EngineCall::RunContainer { image, .. } if *image == config.webssh_image
        )));
    }

    #[tokio::test]
    async fn tidebox_inspect_failure_releases_the_tidebox() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.fail_at(FailPoint::Inspect(config.tidebox_image.clone()));

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::Engine { stage: "inspect tidebox container", .. }));
        assert!(engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::RemoveContainer(id) if id == "000000000001")));
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
        assert!(pair.endpoints().is_none());
    }

    #[tokio::test]
    async fn gateway_inspect_failure_rolls_everything_back() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.fail_at(FailPoint::Inspect(config.webssh_image.clone()));

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::Engine { stage: "inspect webssh container", .. }));
        let removed: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::RemoveContainer(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec!["000000000002", "000000000001"]);
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
    }

    #[tokio::test]
    async fn gateway_that_never_reports_ready_is_torn_down_with_the_tidebox() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.set_output(&config.webssh_image, "npm start\n");

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::NotReady { workload: "webssh", attempts: 3 }));
        let log_reads = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Logs(_)))
            .count();
        assert_eq!(log_reads, 3);
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
        assert!(pair.endpoints().is_none());
    }

    #[tokio::test]
    async fn engine_error_while_awaiting_readiness_rolls_back() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        engine.fail_at(FailPoint::Output(config.tidebox_image.clone()));

        let err = pair.start("h").await.unwrap_err();

        assert!(matches!(err, SandboxError::Engine { stage: "probe workload", .. }));
        let probes = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Exec(_)))
            .count();
        assert_eq!(probes, 1);
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
    }

    #[tokio::test]
    async fn teardown_failure_still_removes_everything_it_can() {
        let config = config();
        let (engine, mut pair) = pair(&config);
        pair.start("h").await.unwrap();
        engine.fail_at(FailPoint::StopContainer);

        let err = pair.stop().await.unwrap_err();

        assert!(matches!(err, SandboxError::Engine { stage: "stop container", .. }));
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(engine.live_networks(), 0);
    }

    #[tokio::test]
    async fn can_restart_after_stop() {
        let config = config();
        let (_engine, mut pair) = pair(&config);
        pair.start("h").await.unwrap();
        let first = pair.id().unwrap().to_string();
        pair.stop().await.unwrap();

        pair.start("h").await.unwrap();
        assert_ne!(pair.id().unwrap(), first);
        pair.stop().await.unwrap();
    }
}
