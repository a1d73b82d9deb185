use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use vellum_core::error::CoreError;
use vellum_models::gateway::*;

use crate::auth::GatewayClaims;
use crate::session::Session;
use crate::GatewayState;

const WS_PING_INTERVAL: Duration = Duration::from_secs(20);
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL: u16 = 1011;

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

pub async fn handle_connection(socket: WebSocket, state: GatewayState, claims: GatewayClaims) {
    let (tenant_id, user_id) = (claims.tenant_id, claims.sub);
    let ctx = vellum_core::tenant::RequestContext::new(tenant_id, user_id);

    let conversations = match state.app.store.user_conversations(&ctx, user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(tenant_id, user_id, "failed to load conversations: {e}");
            let (mut sender, _) = socket.split();
            let _ = send_close(&mut sender, CLOSE_INTERNAL, "internal error").await;
            return;
        }
    };

    let connection = state.broker.connect(tenant_id, user_id, &conversations);
    let mut session = Session::new(connection.id, tenant_id, user_id);
    let hello = ServerFrame::Hello {
        connection_id: connection.id.to_string(),
        user_id,
        tenant_id,
        heartbeat_interval_ms: state.app.config.heartbeat_interval_seconds * 1000,
    };
    let _ = state.broker.send(connection.id, Arc::from(hello.to_json()));

    let (sender, receiver) = socket.split();
    let push_timeout = Duration::from_millis(state.app.config.push_timeout_ms);
    let mut writer = tokio::spawn(write_loop(sender, connection.outbound, push_timeout));

    let reason = read_loop(receiver, &mut writer, &mut session, &state).await;

    state.broker.disconnect(session.connection_id);
    // The writer drains what is queued and closes once its sender is gone.
    if !writer.is_finished() && tokio::time::timeout(push_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(
        tenant_id,
        user_id,
        connection_id = %session.connection_id,
        frames = session.frames_in,
        "client disconnected: {reason}"
    );
}

/// Drain the outbound queue onto the socket. Ends when the broker drops the
/// connection or a push does not complete within `push_timeout`.
async fn write_loop(
    mut sender: impl SinkExt<Message> + Unpin,
    mut outbound: mpsc::Receiver<Arc<str>>,
    push_timeout: Duration,
) {
    let mut ws_ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ws_ping_interval.tick().await;

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(payload) = next else {
                    let _ = send_close(&mut sender, CLOSE_GOING_AWAY, "disconnected").await;
                    return;
                };
                let push = sender.send(Message::Text(payload.to_string().into()));
                match tokio::time::timeout(push_timeout, push).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        tracing::warn!("push timed out after {}ms", push_timeout.as_millis());
                        return;
                    }
                }
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_loop(
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    writer: &mut tokio::task::JoinHandle<()>,
    session: &mut Session,
    state: &GatewayState,
) -> String {
    let heartbeat_timeout = Duration::from_secs(state.app.config.presence_ttl_seconds.max(1));
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);
    let shutdown = state.app.shutdown.notified();
    tokio::pin!(shutdown);
    // Registered once; a notify_waiters between select passes still lands.
    shutdown.as_mut().enable();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        session.record_frame();
                        let frame = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                if reply(state, session, ServerFrame::error(ERR_INVALID_FRAME, e.to_string())).is_err() {
                                    return "outbound queue closed".into();
                                }
                                continue;
                            }
                        };
                        // Heartbeats are never flood limited
                        let is_ping = matches!(frame, ClientFrame::Ping { .. });
                        if !is_ping {
                            if let Err(not_until) = state.flood.check_key(&session.connection_id) {
                                let wait = not_until.wait_time_from(DefaultClock::default().now());
                                tracing::debug!(
                                    user_id = session.user_id,
                                    frame = frame.kind(),
                                    "inbound frame dropped (flooding)"
                                );
                                let error = ServerFrame::Error {
                                    code: ERR_FLOODING.to_string(),
                                    message: "too many frames".into(),
                                    retry_after: Some(wait.as_secs().max(1)),
                                    nonce: None,
                                };
                                if reply(state, session, error).is_err() {
                                    return "outbound queue closed".into();
                                }
                                continue;
                            }
                        }
                        if let Some(response) = handle_client_frame(frame, session, state).await {
                            if reply(state, session, response).is_err() {
                                return "outbound queue closed".into();
                            }
                        }
                        if is_ping {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let error = ServerFrame::error(ERR_INVALID_FRAME, "binary frames are not supported");
                        if reply(state, session, error).is_err() {
                            return "outbound queue closed".into();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame (no code/reason)".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return format!("websocket receive error: {err}"),
                    None => return "websocket stream ended".to_string(),
                }
            }
            () = &mut heartbeat_sleep => {
                return format!("heartbeat timeout after {}s", heartbeat_timeout.as_secs());
            }
            _ = &mut *writer => {
                return "writer closed".to_string();
            }
            () = &mut shutdown => {
                state.broker.send(
                    session.connection_id,
                    Arc::from(ServerFrame::error(ERR_INTERNAL, "server shutting down").to_json()),
                ).ok();
                return "server shutting down".to_string();
            }
        }
    }
}

fn reply(state: &GatewayState, session: &Session, frame: ServerFrame) -> Result<(), ()> {
    state
        .broker
        .send(session.connection_id, Arc::from(frame.to_json()))
        .map_err(|_| ())
}

fn error_frame(err: &CoreError, nonce: Option<String>) -> ServerFrame {
    let (code, message) = err.client_reason();
    if code == ERR_INTERNAL {
        tracing::warn!("gateway operation failed: {err}");
    }
    ServerFrame::Error {
        code: code.to_string(),
        message,
        retry_after: err.retry_after_secs(),
        nonce,
    }
}

async fn handle_client_frame(
    frame: ClientFrame,
    session: &Session,
    state: &GatewayState,
) -> Option<ServerFrame> {
    let ctx = session.context();
    let store = &state.app.store;
    match frame {
        ClientFrame::Ping { nonce } => {
            state.broker.heartbeat(session.connection_id);
            Some(ServerFrame::Pong { nonce })
        }
        ClientFrame::Typing { conversation_id } => {
            state
                .broker
                .relay_typing(session.connection_id, conversation_id);
            None
        }
        ClientFrame::MarkRead { conversation_id } => {
            match store.mark_read(&ctx, conversation_id, session.user_id).await {
                Ok(applied) => Some(ServerFrame::Ack {
                    nonce: None,
                    message_id: None,
                    read_count: Some(applied.value),
                }),
                Err(e) => Some(error_frame(&e, None)),
            }
        }
        ClientFrame::SendMessage {
            conversation_id,
            content,
            confidential,
            nonce,
        } => match store
            .send(&ctx, conversation_id, session.user_id, &content, confidential)
            .await
        {
            Ok(applied) => Some(ServerFrame::Ack {
                nonce,
                message_id: Some(applied.value.id),
                read_count: None,
            }),
            Err(e) => Some(error_frame(&e, nonce)),
        },
        ClientFrame::EditMessage {
            message_id,
            content,
            nonce,
        } => match store.edit(&ctx, message_id, session.user_id, &content).await {
            Ok(applied) => Some(ServerFrame::Ack {
                nonce,
                message_id: Some(applied.value.id),
                read_count: None,
            }),
            Err(e) => Some(error_frame(&e, nonce)),
        },
        ClientFrame::DeleteMessage { message_id, nonce } => {
            match store.delete(&ctx, message_id, session.user_id).await {
                Ok(applied) => Some(ServerFrame::Ack {
                    nonce,
                    message_id: Some(applied.value.id),
                    read_count: None,
                }),
                Err(e) => Some(error_frame(&e, nonce)),
            }
        }
    }
}
