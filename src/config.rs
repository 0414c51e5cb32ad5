//! Sandbox and server configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Container port of the primary workload's SSH daemon.
pub const SSH_PORT: &str = "22/tcp";
/// Container port of the primary workload's mp3 audio stream.
pub const MP3_PORT: &str = "8090/tcp";
/// Container port of the web-terminal gateway.
pub const WEBSSH_PORT: &str = "2222/tcp";

/// Where the gateway expects its configuration file inside the container.
pub const WEBSSH_CONFIG_MOUNT: &str = "/usr/src/config.json";

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_WORKERS: usize = 4;

/// Bounded retry policy shared by both readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_millis(500),
        }
    }
}

/// Where a readiness probe reads its output from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSource {
    /// Run a command inside the container and read its stdout/stderr.
    Exec(Vec<String>),
    /// Read the container's own log output.
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub source: ProbeSource,
    /// Substring that marks the workload as ready.
    pub marker: String,
}

/// Everything needed to provision one sandbox pair.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image of the primary shell/audio workload.
    pub tidebox_image: String,
    /// Image of the web-terminal gateway.
    pub webssh_image: String,
    /// Host path of the gateway configuration, mounted read-only.
    pub webssh_config: PathBuf,
    /// Shared memory for the primary workload, in bytes.
    pub tidebox_shm_bytes: i64,
    pub tidebox_probe: ProbeSpec,
    pub webssh_probe: ProbeSpec,
    pub readiness: ReadinessPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tidebox_image: "parabolala/supertidebox:3".to_string(),
            webssh_image: "parabolala/webssh2:1".to_string(),
            webssh_config: PathBuf::from("resources/webssh_config.json"),
            tidebox_shm_bytes: 128 * 1024 * 1024,
            tidebox_probe: ProbeSpec {
                source: ProbeSource::Exec(vec![
                    "cat".to_string(),
                    "/tmp/supervisord.log".to_string(),
                ]),
                marker: "success: sshd".to_string(),
            },
            webssh_probe: ProbeSpec {
                source: ProbeSource::Logs,
                marker: "WebSSH2 service listening on 0.0.0.0:2222".to_string(),
            },
            readiness: ReadinessPolicy::default(),
        }
    }
}

/// Listener and client-facing settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Hostname used in client-facing URLs instead of the request's Host header.
    pub public_host: Option<String>,
    /// Maximum number of lifecycle jobs running at once.
    pub workers: usize,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
