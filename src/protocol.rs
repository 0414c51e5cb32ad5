//! JSON messages exchanged over the WebSocket endpoints.

use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionSnapshot, SessionState, SessionSummary};

/// Commands sent by the keyboard client.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "client_command", rename_all = "snake_case")]
pub enum ClientCommand {
    /// The performer typed something; the payload itself is not inspected.
    Keystrokes,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SshHostPort {
    pub host: String,
    pub port: u16,
}

/// Pushed to the keyboard client on every state change.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum KeyboardMessage {
    Ssh { ssh: SshHostPort, audio: String },
    Idle,
}

impl KeyboardMessage {
    pub fn for_snapshot(snapshot: &SessionSnapshot) -> Self {
        match (&snapshot.endpoints, snapshot.state()) {
            (Some(endpoints), SessionState::Running) => {
                let (host, port) = endpoints.ssh_hostport();
                KeyboardMessage::Ssh {
                    ssh: SshHostPort {
                        host: host.to_string(),
                        port,
                    },
                    audio: endpoints.mp3_url(),
                }
            }
            _ => KeyboardMessage::Idle,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Url {
    pub url: String,
}

/// Pushed to observer clients.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ObserverMessage {
    Connected {
        ssh: Url,
        mp3: Url,
        session: SessionSummary,
    },
    Connecting {
        id: SessionId,
        session: SessionSummary,
    },
    Disconnected {
        id: SessionId,
    },
    Error {
        id: SessionId,
    },
    #[serde(rename = "unknown session")]
    UnknownSession,
}

impl ObserverMessage {
    /// The message for a state change, if observers are told about it.
    pub fn for_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        let id = snapshot.id();
        match snapshot.state() {
            SessionState::Running => snapshot.endpoints.as_ref().map(|e| ObserverMessage::Connected {
                ssh: Url { url: e.ssh_url() },
                mp3: Url { url: e.mp3_url() },
                session: snapshot.summary.clone(),
            }),
            SessionState::Starting => Some(ObserverMessage::Connecting {
                id,
                session: snapshot.summary.clone(),
            }),
            SessionState::Stopping => Some(ObserverMessage::Disconnected { id }),
            SessionState::Failed => Some(ObserverMessage::Error { id }),
            SessionState::Idle => None,
        }
    }
}

/// Pushed to list watchers.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ListEvent {
    SessionAdd { session: SessionSummary },
    SessionRemove { session: SessionSummary },
    SessionState { session: SessionSummary },
    Keystrokes { keystrokes: KeystrokesBody },
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct KeystrokesBody {
    pub session: SessionSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxEndpoints;
    use serde_json::json;

    fn snapshot(state: SessionState) -> SessionSnapshot {
        SessionSnapshot {
            summary: SessionSummary {
                id: SessionId(4),
                state,
                kb: true,
            },
            endpoints: (state == SessionState::Running).then(|| SandboxEndpoints {
                hostname: "tides.example".to_string(),
                ssh_port: 32768,
                mp3_port: 32769,
                webssh_port: 32770,
                internal_hostname: "a1b2c3d4e5f6".to_string(),
            }),
        }
    }

    #[test]
    fn keyboard_gets_ssh_details_when_running() {
        let msg = KeyboardMessage::for_snapshot(&snapshot(SessionState::Running));
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({
                "mode": "ssh",
                "ssh": {"host": "tides.example", "port": 32768},
                "audio": "http://tides.example:32769/stream.mp3",
            })
        );
    }

    #[test]
    fn keyboard_is_idle_otherwise() {
        for state in [SessionState::Idle, SessionState::Starting, SessionState::Stopping] {
            let msg = KeyboardMessage::for_snapshot(&snapshot(state));
            assert_eq!(serde_json::to_value(msg).unwrap(), json!({"mode": "idle"}));
        }
    }

    #[test]
    fn observer_connected_carries_urls_and_summary() {
        let msg = ObserverMessage::for_snapshot(&snapshot(SessionState::Running)).unwrap();
        assert_eq!(
            serde_json::to_value(msg).unwrap(),
            json!({
                "status": "connected",
                "ssh": {"url": "http://tides.example:32770/ssh/host/a1b2c3d4e5f6?port=22"},
                "mp3": {"url": "http://tides.example:32769/stream.mp3"},
                "session": {"id": 4, "state": "running", "kb": true},
            })
        );
    }

    #[test]
    fn observer_statuses_by_state() {
        let status = |state| {
            ObserverMessage::for_snapshot(&snapshot(state))
                .map(|m| serde_json::to_value(m).unwrap()["status"].clone())
        };
        assert_eq!(status(SessionState::Starting), Some(json!("connecting")));
        assert_eq!(status(SessionState::Stopping), Some(json!("disconnected")));
        assert_eq!(status(SessionState::Failed), Some(json!("error")));
        assert_eq!(status(SessionState::Idle), None);
    }

    #[test]
    fn unknown_session_status_has_a_space() {
        assert_eq!(
            serde_json::to_value(ObserverMessage::UnknownSession).unwrap(),
            json!({"status": "unknown session"})
        );
    }

    #[test]
    fn list_events_are_tagged_by_command() {
        let summary = snapshot(SessionState::Idle).summary;
        assert_eq!(
            serde_json::to_value(ListEvent::SessionAdd { session: summary.clone() }).unwrap(),
            json!({"command": "session_add", "session": {"id": 4, "state": "idle", "kb": true}})
        );
        assert_eq!(
            serde_json::to_value(ListEvent::Keystrokes {
                keystrokes: KeystrokesBody { session: summary },
            })
            .unwrap(),
            json!({"command": "keystrokes", "keystrokes": {"session": {"id": 4, "state": "idle", "kb": true}}})
        );
    }

    #[test]
    fn client_command_ignores_extra_fields() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"client_command":"keystrokes","keys":"d1 $ s \"bd\""}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Keystrokes);
        assert!(serde_json::from_str::<ClientCommand>(r#"{"client_command":"reboot"}"#).is_err());
    }
}
