//! WebSocket sessions.
//!
//! `GET /ws?user_id=&role=` upgrades the connection and registers it with the [connection hub](crate::hub). A `token`
//! query parameter, when present, is verified and its claims take precedence over `user_id` and `role`.
//!
//! Each session runs on the worker's local task set. It forwards frames queued for it by the hub, answers client
//! pings, pings the client every `ping_interval` and closes once nothing has been heard for `idle_timeout`. Server
//! shutdown closes it with 1001 (going away).
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Closed, Message, ProtocolError, Session};
use futures::{Stream, StreamExt};
use homechef_engine::db_types::Role;
use log::*;
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::TokenVerifier,
    data_objects::WsQuery,
    errors::ServerError,
    hub::{Connection, HubHandle, WsFrame},
};

pub const PING_INTERVAL: Duration = Duration::from_secs(54);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub buffer_size: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self { buffer_size: 256, ping_interval: PING_INTERVAL, idle_timeout: IDLE_TIMEOUT }
    }
}

/// Cancelled when the server starts shutting down. Sessions close with 1001 (going away).
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(pub CancellationToken);

#[derive(Debug, Deserialize)]
struct ClientMessage {
    event: String,
}

fn identify(query: WsQuery, verifier: &TokenVerifier) -> Result<(String, Role), ServerError> {
    if let Some(token) = query.token.as_deref() {
        let claims = verifier.verify(token)?;
        return Ok((claims.sub, claims.role));
    }
    match (query.user_id.filter(|u| !u.trim().is_empty()), query.role) {
        (Some(user_id), Some(role)) => Ok((user_id, role)),
        _ => Err(ServerError::invalid_request("The user_id and role query parameters are required.")),
    }
}

pub async fn ws_connect(
    req: HttpRequest,
    body: web::Payload,
    query: web::Query<WsQuery>,
    hub: web::Data<HubHandle>,
    verifier: web::Data<TokenVerifier>,
    settings: web::Data<WsSettings>,
    shutdown: web::Data<ShutdownSignal>,
) -> Result<HttpResponse, ServerError> {
    let (user_id, role) = identify(query.into_inner(), verifier.as_ref())?;
    let (response, mut session, stream) = actix_ws::handle(&req, body).map_err(|e| {
        debug!("🔌️ Could not upgrade the connection for {role}:{user_id}. {e}");
        ServerError::invalid_request(format!("Could not upgrade to a WebSocket. {e}"))
    })?;
    let (conn, frames) = Connection::new(user_id, role, settings.buffer_size);
    hub.register(conn.clone()).await;
    let hub = hub.get_ref().clone();
    let settings = *settings.get_ref();
    let shutdown = shutdown.0.clone();
    actix_web::rt::spawn(async move {
        let reason = run_session(&mut session, stream, frames, &conn, settings, shutdown).await;
        hub.unregister(conn.id).await;
        let _ = session.close(reason).await;
    });
    Ok(response)
}

/// The outbound half of a session.
trait FrameSink {
    async fn send_text(&mut self, text: String) -> Result<(), Closed>;
    async fn send_ping(&mut self) -> Result<(), Closed>;
    async fn send_pong(&mut self, bytes: &[u8]) -> Result<(), Closed>;
}

impl FrameSink for Session {
    async fn send_text(&mut self, text: String) -> Result<(), Closed> {
        self.text(text).await
    }

    async fn send_ping(&mut self) -> Result<(), Closed> {
        self.ping(b"").await
    }

    async fn send_pong(&mut self, bytes: &[u8]) -> Result<(), Closed> {
        self.pong(bytes).await
    }
}

/// Pumps the session until it ends and returns the reason to close it with. The session is closed once nothing has
/// been heard from the client for `idle_timeout`, measured from the last inbound frame.
async fn run_session<K, S>(
    sink: &mut K,
    mut stream: S,
    mut frames: mpsc::Receiver<WsFrame>,
    conn: &Connection,
    settings: WsSettings,
    shutdown: CancellationToken,
) -> Option<CloseReason>
where
    K: FrameSink,
    S: Stream<Item = Result<Message, ProtocolError>> + Unpin,
{
    let mut last_seen = Instant::now();
    let mut heartbeat = tokio::time::interval_at(last_seen + settings.ping_interval, settings.ping_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                return Some(CloseReason { code: CloseCode::Away, description: Some("Server shutting down".into()) });
            }
            _ = conn.kick.cancelled() => {
                return Some(CloseReason { code: CloseCode::Policy, description: Some("Too slow".into()) });
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { return None };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sink.send_text(text).await.is_err() {
                            return None;
                        }
                    },
                    Err(e) => warn!("🔌️ Could not serialize {} frame. {e}", frame.event),
                }
            }
            msg = stream.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let is_ping = serde_json::from_str::<ClientMessage>(&text).map(|m| m.event == "ping");
                        match is_ping {
                            Ok(true) => {
                                let pong = serde_json::to_string(&WsFrame::pong(&conn.user_id)).unwrap_or_default();
                                if sink.send_text(pong).await.is_err() {
                                    return None;
                                }
                            },
                            Ok(false) => trace!("🔌️ Ignoring client message from {}", conn.id),
                            Err(e) => debug!("🔌️ Unreadable message from {}. {e}", conn.id),
                        }
                    },
                    Some(Ok(Message::Ping(bytes))) => {
                        if sink.send_pong(&bytes).await.is_err() {
                            return None;
                        }
                    },
                    Some(Ok(Message::Close(reason))) => {
                        trace!("🔌️ {} closed the connection", conn.id);
                        return reason;
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        debug!("🔌️ Protocol error on {}. {e}", conn.id);
                        return None;
                    },
                    None => return None,
                }
            }
            _ = tokio::time::sleep_until(last_seen + settings.idle_timeout) => {
                debug!("🔌️ Nothing heard from {} for {:?}. Closing", conn.id, settings.idle_timeout);
                return Some(CloseReason { code: CloseCode::Normal, description: Some("Heartbeat timeout".into()) });
            }
            _ = heartbeat.tick() => {
                if sink.send_ping().await.is_err() {
                    return None;
                }
            }
        }
    }
}
