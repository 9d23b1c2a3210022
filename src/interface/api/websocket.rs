//! WebSocket control channel
//!
//! Every connection gets its own [`DialerSession`]. Client commands are
//! JSON objects tagged by `type`; dialer events and auto-dialer status
//! changes are pushed back the same way. Closing the socket shuts the
//! session down.

use super::router::AppState;
use crate::application::session::{ActiveCall, DialerSession, SessionConfig};
use crate::domain::auto_dialer::{DialerStatus, SchedulerSettings, WorkingHours};
use crate::domain::number_registry::NumberRecord;
use crate::domain::shared::{CallAttemptId, Credentials, DialerEvent, NumberEntry};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn default_sip_port() -> u16 {
    5060
}

/// Commands sent by the UI
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        username: String,
        password: String,
        sip_server: String,
        #[serde(default = "default_sip_port")]
        port: u16,
        #[serde(default)]
        realm: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Call {
        number: String,
        #[serde(default)]
        label: String,
    },
    /// Hang up one call, or every call when `call_id` is absent
    #[serde(rename_all = "camelCase")]
    Hangup {
        #[serde(default)]
        call_id: Option<CallAttemptId>,
    },
    #[serde(rename_all = "camelCase")]
    StartAutoDialer {
        numbers: Vec<NumberEntry>,
        #[serde(default)]
        working_hours_start: Option<String>,
        #[serde(default)]
        working_hours_end: Option<String>,
        #[serde(default)]
        min_interval: Option<u64>,
        #[serde(default)]
        max_interval: Option<u64>,
        #[serde(default)]
        max_active_calls: Option<usize>,
        /// Batch call-duration override, both bounds or neither
        #[serde(default)]
        min_duration: Option<u64>,
        #[serde(default)]
        max_duration: Option<u64>,
    },
    StopAutoDialer,
    GetStats,
}

/// Messages pushed to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Registered,
    #[serde(rename_all = "camelCase")]
    RegistrationFailed { reason: String },
    #[serde(rename_all = "camelCase")]
    CallStarted {
        call_id: CallAttemptId,
        number: String,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    Ringing { call_id: CallAttemptId },
    #[serde(rename_all = "camelCase")]
    CallEstablished {
        call_id: CallAttemptId,
        sdp: String,
        hangup_in_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    CallFailed {
        call_id: CallAttemptId,
        status_code: Option<u16>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: CallAttemptId, cause: String },
    AutoDialerStatus {
        #[serde(flatten)]
        status: DialerStatus,
    },
    Stats {
        calls: Vec<ActiveCall>,
        numbers: Vec<NumberRecord>,
    },
    Error { message: String },
}

impl From<DialerEvent> for ServerMessage {
    fn from(event: DialerEvent) -> Self {
        match event {
            DialerEvent::Registered => ServerMessage::Registered,
            DialerEvent::RegistrationFailed { reason } => ServerMessage::RegistrationFailed { reason },
            DialerEvent::CallStarted { call_id, number, label } => {
                ServerMessage::CallStarted { call_id, number, label }
            }
            DialerEvent::Ringing { call_id } => ServerMessage::Ringing { call_id },
            DialerEvent::Established {
                call_id,
                sdp_answer,
                hangup_in_seconds,
            } => ServerMessage::CallEstablished {
                call_id,
                sdp: sdp_answer,
                hangup_in_seconds,
            },
            DialerEvent::CallFailed {
                call_id,
                status_code,
                reason,
            } => ServerMessage::CallFailed {
                call_id,
                status_code,
                reason,
            },
            DialerEvent::Ended { call_id, cause } => ServerMessage::CallEnded {
                call_id,
                cause: cause.to_string(),
            },
        }
    }
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// WebSocket handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DialerEvent>();

    let session = DialerSession::new(
        SessionConfig::from_config(&state.config),
        Arc::new(event_tx),
        state.registry.clone(),
    );
    info!("WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        debug!("Failed to send message to WebSocket client");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize message: {}", e),
            }
        }
    });

    let events_out = out_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!("Forwarding {} event", event.event_type());
            if events_out.send(event.into()).is_err() {
                break;
            }
        }
    });

    let status_out = out_tx.clone();
    let mut status = session.auto_dialer_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if status_out.send(ServerMessage::AutoDialerStatus { status: current }).is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(command) => handle_command(&session, &state, command).await,
                    Err(e) => {
                        warn!("Invalid WebSocket message: {}", e);
                        Some(ServerMessage::error(format!("Invalid message: {}", e)))
                    }
                };
                if let Some(reply) = reply {
                    let _ = out_tx.send(reply);
                }
            }
            Message::Close(_) => {
                debug!("Received close message");
                break;
            }
            Message::Binary(_) => debug!("Received binary message (ignored)"),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    info!("WebSocket client disconnected");
    session.shutdown().await;
    status_task.abort();
    event_task.abort();
    send_task.abort();
}

async fn handle_command(session: &DialerSession, state: &AppState, command: ClientMessage) -> Option<ServerMessage> {
    match command {
        ClientMessage::Register {
            username,
            password,
            sip_server,
            port,
            realm,
        } => {
            let credentials = Credentials {
                username,
                password,
                realm: realm.filter(|r| !r.is_empty()),
                sip_server,
                port,
            };
            session
                .register(credentials)
                .await
                .err()
                .map(|e| ServerMessage::error(e.to_string()))
        }
        ClientMessage::Call { number, label } => session
            .place_call(&number, &label)
            .await
            .err()
            .map(|e| ServerMessage::error(e.to_string())),
        ClientMessage::Hangup { call_id: Some(id) } => session
            .hangup(id)
            .await
            .err()
            .map(|e| ServerMessage::error(e.to_string())),
        ClientMessage::Hangup { call_id: None } => {
            session.hangup_all().await;
            None
        }
        ClientMessage::StartAutoDialer {
            numbers,
            working_hours_start,
            working_hours_end,
            min_interval,
            max_interval,
            max_active_calls,
            min_duration,
            max_duration,
        } => {
            let defaults = &state.config.auto_dialer;
            let working_hours = match WorkingHours::parse(
                working_hours_start.as_deref().unwrap_or(&defaults.working_hours_start),
                working_hours_end.as_deref().unwrap_or(&defaults.working_hours_end),
            ) {
                Ok(hours) => hours,
                Err(e) => return Some(ServerMessage::error(e.to_string())),
            };
            let settings = SchedulerSettings {
                pool: numbers,
                concurrency_cap: max_active_calls.unwrap_or(defaults.max_active_calls),
                min_interval_seconds: min_interval.unwrap_or(defaults.min_interval_seconds),
                max_interval_seconds: max_interval.unwrap_or(defaults.max_interval_seconds),
                working_hours,
                duration_override: min_duration.zip(max_duration),
            };
            session
                .start_auto_dialer(settings)
                .await
                .err()
                .map(|e| ServerMessage::error(e.to_string()))
        }
        ClientMessage::StopAutoDialer => {
            session.stop_auto_dialer().await;
            None
        }
        ClientMessage::GetStats => Some(ServerMessage::Stats {
            calls: session.active_calls().await,
            numbers: session.registry().get_candidates().await,
        }),
    }
}
