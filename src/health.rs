//! Readiness probes for sandbox workloads.
//!
//! The engine reporting a container as started says nothing about whether its
//! services accept connections yet, so each workload is polled for a startup
//! marker in its output.

use tracing::info;

use crate::config::{ProbeSource, ProbeSpec, ReadinessPolicy};
use crate::engine::Engine;
use crate::error::SandboxError;

/// Poll `container` until its output contains the probe's marker.
///
/// Engine errors abort the probe immediately; a marker that never shows up
/// fails with [`SandboxError::NotReady`] once the policy's attempts run out.
pub async fn wait_until_ready(
    engine: &dyn Engine,
    workload: &'static str,
    container: &str,
    probe: &ProbeSpec,
    policy: ReadinessPolicy,
) -> Result<(), SandboxError> {
    let mut remaining = policy.attempts;
    while remaining > 0 {
        let output = match &probe.source {
            ProbeSource::Exec(cmd) => engine.exec_output(container, cmd).await,
            ProbeSource::Logs => engine.container_logs(container).await,
        }
        .map_err(SandboxError::engine("probe workload"))?;

        if output.contains(&probe.marker) {
            info!(workload, container, "Workload ready");
            return Ok(());
        }

        info!(workload, remaining, "Workload still not started");
        remaining -= 1;
        tokio::time::sleep(policy.interval).await;
    }

    Err(SandboxError::NotReady {
        workload,
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, SimulatedEngine, WorkloadSpec};
    use std::time::Duration;

    async fn engine_with_container(output: &str) -> (SimulatedEngine, String) {
        let engine = SimulatedEngine::new();
        engine.set_output("img", output);
        engine.create_network("n").await.unwrap();
        let id = engine
            .run_container(&WorkloadSpec {
                image: "img".to_string(),
                network: "n".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (engine, id)
    }

    fn logs_probe(marker: &str) -> ProbeSpec {
        ProbeSpec {
            source: ProbeSource::Logs,
            marker: marker.to_string(),
        }
    }

    #[tokio::test]
    async fn ready_on_first_matching_output() {
        let (engine, id) = engine_with_container("booting\nlistening on 2222\n").await;

        wait_until_ready(&engine, "gateway", &id, &logs_probe("listening"), ReadinessPolicy::default())
            .await
            .unwrap();

        let logs = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Logs(_)))
            .count();
        assert_eq!(logs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let (engine, id) = engine_with_container("nothing useful").await;
        let probe = ProbeSpec {
            source: ProbeSource::Exec(vec!["cat".to_string(), "/tmp/supervisord.log".to_string()]),
            marker: "success: sshd".to_string(),
        };

        let started = tokio::time::Instant::now();
        let err = wait_until_ready(&engine, "tidebox", &id, &probe, ReadinessPolicy::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::NotReady { workload: "tidebox", attempts: 30 }));
        let execs = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Exec(_)))
            .count();
        assert_eq!(execs, 30);
        assert!(started.elapsed() >= Duration::from_millis(500) * 30);
    }

    #[tokio::test]
    async fn engine_error_aborts_probe() {
        let engine = SimulatedEngine::new();
        let err = wait_until_ready(&engine, "gateway", "gone", &logs_probe("x"), ReadinessPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Engine { .. }));
        assert_eq!(engine.calls().len(), 1);
    }
}
