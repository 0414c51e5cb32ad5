//! In-memory engine that simulates networks and containers.
//!
//! Test builds also record every call, so tests can assert on the exact
//! sequence of engine operations, and can inject failures at chosen points.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ContainerDetails, Engine, WorkloadSpec};
use crate::config::SandboxConfig;
use crate::error::{EngineError, EngineResult};

/// First host port handed out, mirroring the usual ephemeral range.
const FIRST_HOST_PORT: u16 = 32768;

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateNetwork(String),
    RemoveNetwork(String),
    RunContainer { image: String, network: String },
    Inspect(String),
    Exec(String),
    Logs(String),
    StopContainer(String),
    RemoveContainer(String),
}

/// Operations that can be made to fail.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateNetwork,
    /// Starting a container from this image.
    Launch(String),
    /// Inspecting a container started from this image.
    Inspect(String),
    /// Reading exec output or logs of a container started from this image.
    Output(String),
    StopContainer,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct Tap {
    failures: HashSet<FailPoint>,
    calls: Vec<EngineCall>,
}

#[derive(Debug)]
struct SimContainer {
    image: String,
    ports: HashMap<String, u16>,
    running: bool,
}

#[derive(Debug)]
struct World {
    next_host_port: u16,
    next_container: u64,
    networks: HashSet<String>,
    containers: HashMap<String, SimContainer>,
    /// Output served to probes, keyed by image.
    outputs: HashMap<String, String>,
}

impl World {
    /// Host ports for `published`, wrapping around within the ephemeral range
    /// and skipping ports held by live containers.
    fn allocate_ports(&mut self, published: &[&str]) -> EngineResult<HashMap<String, u16>> {
        let mut in_use: HashSet<u16> = self
            .containers
            .values()
            .flat_map(|c| c.ports.values().copied())
            .collect();
        let mut ports = HashMap::new();
        for port in published {
            let host_port = self.next_free_port(&in_use)?;
            in_use.insert(host_port);
            ports.insert(port.to_string(), host_port);
        }
        Ok(ports)
    }

    fn next_free_port(&mut self, in_use: &HashSet<u16>) -> EngineResult<u16> {
        for _ in FIRST_HOST_PORT..=u16::MAX {
            let port = self.next_host_port;
            self.next_host_port = port.checked_add(1).unwrap_or(FIRST_HOST_PORT);
            if !in_use.contains(&port) {
                return Ok(port);
            }
        }
        Err(EngineError::Rejected("no free host ports".to_string()))
    }
}

pub struct SimulatedEngine {
    world: Mutex<World>,
    #[cfg(test)]
    tap: Mutex<Tap>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            world: Mutex::new(World {
                next_host_port: FIRST_HOST_PORT,
                next_container: 0,
                networks: HashSet::new(),
                containers: HashMap::new(),
                outputs: HashMap::new(),
            }),
            #[cfg(test)]
            tap: Mutex::default(),
        }
    }

    /// An engine whose containers print the readiness markers `config` probes for.
    pub fn ready_for(config: &SandboxConfig) -> Self {
        let engine = Self::new();
        engine.set_output(&config.tidebox_image, &config.tidebox_probe.marker);
        engine.set_output(&config.webssh_image, &config.webssh_probe.marker);
        engine
    }

    /// Replace the exec/log output of containers started from `image`.
    pub fn set_output(&self, image: &str, output: &str) {
        self.world()
            .outputs
            .insert(image.to_string(), output.to_string());
    }

    fn world(&self) -> MutexGuard<'_, World> {
        // A panicking test thread must not hide the engine state from others.
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn output_of(&self, id: &str) -> EngineResult<String> {
        let world = self.world();
        let container = world
            .containers
            .get(id)
            .ok_or_else(|| not_found("container", id))?;
        #[cfg(test)]
        self.check(FailPoint::Output(container.image.clone()))?;
        Ok(world.outputs.get(&container.image).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
impl SimulatedEngine {
    pub fn fail_at(&self, point: FailPoint) {
        self.tap().failures.insert(point);
    }

    pub fn clear_failures(&self) {
        self.tap().failures.clear();
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.tap().calls.clone()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> usize {
        self.world().containers.len()
    }

    pub fn running_containers(&self) -> usize {
        self.world().containers.values().filter(|c| c.running).count()
    }

    pub fn live_networks(&self) -> usize {
        self.world().networks.len()
    }

    fn tap(&self) -> MutexGuard<'_, Tap> {
        self.tap.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: EngineCall) {
        self.tap().calls.push(call);
    }

    fn check(&self, point: FailPoint) -> EngineResult<()> {
        if self.tap().failures.contains(&point) {
            return Err(EngineError::Rejected(format!("injected failure: {point:?}")));
        }
        Ok(())
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &'static str, id: &str) -> EngineError {
    EngineError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn create_network(&self, name: &str) -> EngineResult<()> {
        #[cfg(test)]
        {
            self.record(EngineCall::CreateNetwork(name.to_string()));
            self.check(FailPoint::CreateNetwork)?;
        }
        if !self.world().networks.insert(name.to_string()) {
            return Err(EngineError::Rejected(format!("network {name} already exists")));
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        #[cfg(test)]
        self.record(EngineCall::RemoveNetwork(name.to_string()));
        if !self.world().networks.remove(name) {
            return Err(not_found("network", name));
        }
        Ok(())
    }

    async fn run_container(&self, spec: &WorkloadSpec) -> EngineResult<String> {
        #[cfg(test)]
        self.record(EngineCall::RunContainer {
            image: spec.image.clone(),
            network: spec.network.clone(),
        });
        let mut world = self.world();
        if !world.networks.contains(&spec.network) {
            return Err(not_found("network", &spec.network));
        }
        #[cfg(test)]
        self.check(FailPoint::Launch(spec.image.clone()))?;

        let ports = world.allocate_ports(&spec.published_ports)?;
        world.next_container += 1;
        let id = format!("{:012x}", world.next_container);
        world.containers.insert(
            id.clone(),
            SimContainer {
                image: spec.image.clone(),
                ports,
                running: true,
            },
        );
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        #[cfg(test)]
        self.record(EngineCall::Inspect(id.to_string()));
        let world = self.world();
        let container = world
            .containers
            .get(id)
            .ok_or_else(|| not_found("container", id))?;
        #[cfg(test)]
        self.check(FailPoint::Inspect(container.image.clone()))?;
        Ok(ContainerDetails {
            hostname: id.to_string(),
            ports: container.ports.clone(),
        })
    }

    async fn exec_output(&self, id: &str, _cmd: &[String]) -> EngineResult<String> {
        #[cfg(test)]
        self.record(EngineCall::Exec(id.to_string()));
        self.output_of(id)
    }

    async fn container_logs(&self, id: &str) -> EngineResult<String> {
        #[cfg(test)]
        self.record(EngineCall::Logs(id.to_string()));
        self.output_of(id)
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        #[cfg(test)]
        {
            self.record(EngineCall::StopContainer(id.to_string()));
            self.check(FailPoint::StopContainer)?;
        }
        let mut world = self.world();
        let container = world
            .containers
            .get_mut(id)
            .ok_or_else(|| not_found("container", id))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        #[cfg(test)]
        self.record(EngineCall::RemoveContainer(id.to_string()));
        self.world()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("container", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(network: &str) -> WorkloadSpec {
        WorkloadSpec {
            image: "img".to_string(),
            network: network.to_string(),
            published_ports: vec!["22/tcp", "8090/tcp"],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn containers_get_distinct_host_ports() {
        let engine = SimulatedEngine::new();
        engine.create_network("n").await.unwrap();
        let a = engine.run_container(&spec("n")).await.unwrap();
        let b = engine.run_container(&spec("n")).await.unwrap();

        let a = engine.inspect_container(&a).await.unwrap();
        let b = engine.inspect_container(&b).await.unwrap();
        let mut ports: Vec<u16> = a.ports.values().chain(b.ports.values()).copied().collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }

    #[tokio::test]
    async fn container_requires_existing_network() {
        let engine = SimulatedEngine::new();
        let err = engine.run_container(&spec("missing")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "network", .. }));
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn host_ports_wrap_back_into_the_ephemeral_range() {
        let engine = SimulatedEngine::new();
        engine.create_network("n").await.unwrap();
        engine.world().next_host_port = u16::MAX;

        let id = engine.run_container(&spec("n")).await.unwrap();

        let mut ports: Vec<u16> = engine
            .inspect_container(&id)
            .await
            .unwrap()
            .ports
            .into_values()
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![FIRST_HOST_PORT, u16::MAX]);
    }

    #[tokio::test]
    async fn wrapped_ports_skip_those_still_in_use() {
        let engine = SimulatedEngine::new();
        engine.create_network("n").await.unwrap();
        let first = engine.run_container(&spec("n")).await.unwrap();
        engine.world().next_host_port = u16::MAX;

        let second = engine.run_container(&spec("n")).await.unwrap();

        let held: Vec<u16> = engine.world().containers[&first].ports.values().copied().collect();
        let mut ports: Vec<u16> = engine.world().containers[&second]
            .ports
            .values()
            .copied()
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![FIRST_HOST_PORT + 2, u16::MAX]);
        assert!(ports.iter().all(|p| !held.contains(p)));
    }

    #[tokio::test]
    async fn exhausted_host_ports_reject_the_container() {
        let engine = SimulatedEngine::new();
        engine.create_network("n").await.unwrap();
        let every_port = (FIRST_HOST_PORT..=u16::MAX).map(|p| (p.to_string(), p)).collect();
        engine.world().containers.insert(
            "hog".to_string(),
            SimContainer {
                image: "img".to_string(),
                ports: every_port,
                running: true,
            },
        );

        let err = engine.run_container(&spec("n")).await.unwrap_err();

        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(engine.live_containers(), 1);
    }

    #[tokio::test]
    async fn removing_twice_reports_not_found() {
        let engine = SimulatedEngine::new();
        engine.create_network("n").await.unwrap();
        let id = engine.run_container(&spec("n")).await.unwrap();
        engine.remove_container(&id).await.unwrap();
        assert!(engine.remove_container(&id).await.is_err());
    }
}
