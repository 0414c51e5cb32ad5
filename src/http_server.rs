//! HTTP and WebSocket server implementation using Axum.
//!
//! Each socket gets a writer task fed by an unbounded channel, so session
//! notifications (which arrive synchronously, under the session's lock) only
//! ever enqueue.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::controller::{ListWatcher, SessionsController};
use crate::error::ControllerError;
use crate::protocol::{ClientCommand, KeyboardMessage, KeystrokesBody, ListEvent, ObserverMessage};
use crate::session::{SessionId, SessionObserver, SessionSnapshot, SessionState, SessionSummary};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/console", get(console))
        .route("/observe/:target", get(observe))
        .route("/watch_list", get(watch_list))
        .route("/list", get(list_sessions))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        // The browser client is served from its own origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.controller.list_sessions())
}

enum Outbound {
    Text(String),
    Close,
}

/// Queue of frames for one socket's writer task.
#[derive(Clone)]
struct Outbox(mpsc::UnboundedSender<Outbound>);

impl Outbox {
    fn send_json(&self, message: &impl Serialize) {
        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = self.0.send(Outbound::Text(text));
            }
            Err(e) => warn!(error = %e, "Failed to encode message"),
        }
    }

    fn close(&self) {
        let _ = self.0.send(Outbound::Close);
    }
}

fn spawn_writer(socket: WebSocket) -> (Outbox, SplitStream<WebSocket>, JoinHandle<()>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, rx));
    (Outbox(tx), stream, writer)
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Wait for the peer to go away; returns each text frame to `on_text`.
async fn read_until_closed(stream: &mut SplitStream<WebSocket>, mut on_text: impl FnMut(String)) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => on_text(text),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

struct KeyboardConnection(Outbox);

impl SessionObserver for KeyboardConnection {
    fn on_session_state_change(&self, session: &SessionSnapshot) {
        self.0.send_json(&KeyboardMessage::for_snapshot(session));
    }
}

struct ObserverConnection(Outbox);

impl SessionObserver for ObserverConnection {
    fn on_session_state_change(&self, session: &SessionSnapshot) {
        if let Some(message) = ObserverMessage::for_snapshot(session) {
            self.0.send_json(&message);
        }
        if session.state() == SessionState::Failed {
            self.0.close();
        }
    }
}

struct ListConnection(Outbox);

impl ListWatcher for ListConnection {
    fn on_session_add(&self, session: &SessionSummary) {
        self.0.send_json(&ListEvent::SessionAdd {
            session: session.clone(),
        });
    }

    fn on_session_remove(&self, session: &SessionSummary) {
        self.0.send_json(&ListEvent::SessionRemove {
            session: session.clone(),
        });
    }

    fn on_session_state_change(&self, session: &SessionSummary) {
        self.0.send_json(&ListEvent::SessionState {
            session: session.clone(),
        });
    }

    fn on_keystrokes(&self, session: &SessionSummary) {
        self.0.send_json(&ListEvent::Keystrokes {
            keystrokes: KeystrokesBody {
                session: session.clone(),
            },
        });
    }
}

async fn console(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let hostname = state.hostname_for(&headers);
    ws.on_upgrade(move |socket| handle_console(socket, state.controller, hostname))
}

async fn handle_console(socket: WebSocket, controller: SessionsController, hostname: String) {
    let (outbox, mut stream, writer) = spawn_writer(socket);
    let client = controller.next_client_id();
    let session =
        controller.keyboard_connected(client, Arc::new(KeyboardConnection(outbox)), &hostname);

    read_until_closed(&mut stream, |text| {
        match serde_json::from_str::<ClientCommand>(&text) {
            Ok(ClientCommand::Keystrokes) => {
                debug!(client = client.0, session_id = %session.id(), "Keystrokes");
                controller.on_keystrokes(&session);
            }
            Err(e) => warn!(client = client.0, error = %e, "Ignoring invalid client message"),
        }
    })
    .await;

    controller.keyboard_disconnected(client).await;
    writer.abort();
}

/// `new` or a session id.
fn parse_target(target: &str) -> Option<Option<SessionId>> {
    if target == "new" {
        return Some(None);
    }
    target.parse().ok().map(|id| Some(SessionId(id)))
}

async fn observe(
    State(state): State<AppState>,
    Path(target): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(target) = parse_target(&target) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let hostname = state.hostname_for(&headers);
    ws.on_upgrade(move |socket| handle_observe(socket, state.controller, target, hostname))
}

async fn handle_observe(
    socket: WebSocket,
    controller: SessionsController,
    target: Option<SessionId>,
    hostname: String,
) {
    let (outbox, mut stream, writer) = spawn_writer(socket);
    let client = controller.next_client_id();

    // Provisioning runs to completion even if the observer leaves early.
    let mut observation = tokio::spawn({
        let controller = controller.clone();
        let observer = Arc::new(ObserverConnection(outbox.clone()));
        async move {
            controller
                .start_observation(client, observer, target, &hostname)
                .await
        }
    });

    let mut pending = true;
    loop {
        tokio::select! {
            result = &mut observation, if pending => {
                pending = false;
                match result {
                    Ok(Ok(session)) => debug!(client = client.0, session_id = %session.id(), "Observer attached"),
                    Ok(Err(ControllerError::SessionNotFound(id))) => {
                        info!(client = client.0, session_id = %id, "Observer asked for unknown session");
                        outbox.send_json(&ObserverMessage::UnknownSession);
                        outbox.close();
                    }
                    // The observer has already been sent the error status.
                    Ok(Err(e)) => warn!(client = client.0, error = %e, "Observation failed"),
                    Err(e) => error!(client = client.0, error = %e, "Observation task failed"),
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if pending {
        let _ = observation.await;
    }
    controller.stop_observation(client).await;
    writer.abort();
}

async fn watch_list(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_watch_list(socket, state.controller))
}

async fn handle_watch_list(socket: WebSocket, controller: SessionsController) {
    let (outbox, mut stream, writer) = spawn_writer(socket);
    let client = controller.next_client_id();
    controller.add_list_watcher(client, Arc::new(ListConnection(outbox)));

    read_until_closed(&mut stream, |_| {}).await;

    controller.remove_list_watcher(client);
    writer.abort();
}
