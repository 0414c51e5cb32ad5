//! Shared application state.

use axum::http::{header, HeaderMap};

use crate::controller::SessionsController;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: SessionsController,
    /// Overrides the Host header when building client-facing URLs.
    pub public_host: Option<String>,
}

impl AppState {
    pub fn new(controller: SessionsController, public_host: Option<String>) -> Self {
        Self {
            controller,
            public_host,
        }
    }

    /// Hostname clients should use to reach sandboxes on this machine.
    pub fn hostname_for(&self, headers: &HeaderMap) -> String {
        if let Some(host) = &self.public_host {
            return host.clone();
        }
        headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(strip_port)
            .filter(|host| !host.is_empty())
            .unwrap_or("localhost")
            .to_string()
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
