use crate::auth;
use crate::db;
use crate::db::custom_types::UserRole;
use crate::db::sessions::Session;
use crate::fabric::session_group;
use crate::fabric::user_group;
use crate::routes::AppState;
use crate::session;
use crate::session::CallError;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::response::IntoResponse;
use commons::close_code;
use commons::ClientMessage;
use commons::EndReason;
use commons::Event;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Time between `call_ended` and the server-side close of the attachment.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// An attachment that sends nothing (not even heartbeats) for this long
/// is considered gone.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    token: String,
}

pub async fn call_attachment_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<Uuid>,
    Query(query): Query<AttachQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| call_attachment(socket, state, session_id, query.token))
}

/// One participant's live connection to a call. Authenticates, runs the
/// admission gauntlet, then relays between the socket and the session
/// group until the call ends or the client leaves. Losing this attachment
/// never stops the timer; the runner owns the session's lifetime.
async fn call_attachment(socket: WebSocket, state: Arc<AppState>, session_id: Uuid, token: String) {
    let (mut sink, mut stream) = socket.split();

    let Some(user_id) = authenticate(&mut sink, &state, &token).await else {
        return;
    };

    let session = match load_session(&state, session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            refuse(&mut sink, close_code::NO_SUCH_SESSION, "Call session not found").await;
            return;
        }
        Err(e) => {
            tracing::error!(%session_id, "Failed to load session on attach: {e:#}");
            refuse(&mut sink, 1011, "Internal error").await;
            return;
        }
    };

    if session.status.is_terminal() {
        refuse(
            &mut sink,
            close_code::SESSION_TERMINAL,
            "Call session has ended and cannot be reconnected",
        )
        .await;
        return;
    }
    if !session.is_participant(user_id) {
        refuse(
            &mut sink,
            close_code::NOT_PARTICIPANT,
            "You are not a participant in this call",
        )
        .await;
        return;
    }

    match payment_valid(&state, &session) {
        Ok(true) => {}
        Ok(false) => {
            refuse(
                &mut sink,
                close_code::PAYMENT_INVALID,
                "Payment validation failed",
            )
            .await;
            return;
        }
        Err(e) => {
            tracing::error!(%session_id, "Payment check failed on attach: {e:#}");
            refuse(&mut sink, 1011, "Internal error").await;
            return;
        }
    }

    // Join the group before the snapshot so no transition is missed
    // between the two.
    let mut rx = state.fabric.subscribe(&session_group(session_id));
    state.engine.ensure_runner(session_id);

    let now = OffsetDateTime::now_utc();
    if send_event(
        &mut sink,
        &Event::ConnectionEstablished {
            envelope: session::envelope(&session, now),
        },
    )
    .await
    .is_err()
    {
        return;
    }
    let _ = send_event(&mut sink, &session::status_snapshot(&session, now)).await;

    tracing::debug!(%session_id, %user_id, "Participant attached to call");

    // Every inbound frame, heartbeats included, pushes the deadline out.
    let mut idle_deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::debug!(%session_id, %user_id, "Attachment idle, closing");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    idle_deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;
                    if handle_client_message(&mut sink, &state, session_id, user_id, &text)
                        .await
                        .is_break()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    idle_deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;
                }
                Some(Err(e)) => {
                    tracing::debug!(%session_id, %user_id, "Attachment socket error: {e}");
                    break;
                }
            },
            event = rx.recv() => match event {
                Ok(event) => {
                    // Relays fan out to the *other* attachment only.
                    if let Event::SignalRelay { sender_id, .. } = &event {
                        if *sender_id == user_id {
                            continue;
                        }
                    }

                    let call_over = matches!(event, Event::CallEnded { .. });
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                    if call_over {
                        tokio::time::sleep(CLOSE_GRACE).await;
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: "call ended".into(),
                            })))
                            .await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Resynchronize a slow client with a fresh snapshot.
                    tracing::warn!(%session_id, %user_id, missed, "Attachment lagged behind");
                    if let Ok(Some(session)) = load_session(&state, session_id) {
                        let now = OffsetDateTime::now_utc();
                        if send_event(&mut sink, &session::status_snapshot(&session, now))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // Dropping `rx` drops the group membership; the runner and the other
    // participant carry on.
    tracing::debug!(%session_id, %user_id, "Participant detached from call");
}

async fn handle_client_message(
    sink: &mut WsSink,
    state: &Arc<AppState>,
    session_id: Uuid,
    user_id: Uuid,
    text: &str,
) -> ControlFlow<()> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(_) => {
            let frame = Event::Error {
                code: 400,
                message: "Invalid message".to_string(),
                server_time: OffsetDateTime::now_utc(),
            };
            return match send_event(sink, &frame).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            };
        }
    };

    match message {
        ClientMessage::Ping => {
            if send_event(sink, &Event::Pong).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        ClientMessage::GetStatus => match load_session(state, session_id) {
            Ok(Some(session)) => {
                let now = OffsetDateTime::now_utc();
                if send_event(sink, &session::status_snapshot(&session, now))
                    .await
                    .is_err()
                {
                    return ControlFlow::Break(());
                }
            }
            Ok(None) => return ControlFlow::Break(()),
            Err(e) => {
                tracing::error!(%session_id, "Status request failed: {e:#}");
            }
        },
        ClientMessage::SignalRelay { payload } => {
            // Opaque; fanned to the peer without interpretation. Dropped
            // silently when nobody else is attached.
            state.fabric.publish(
                &session_group(session_id),
                Event::SignalRelay {
                    sender_id: user_id,
                    payload,
                },
            );
        }
        ClientMessage::End => {
            match state
                .engine
                .end_call(session_id, Some(user_id), EndReason::Hangup)
                .await
            {
                // The call_ended fan-out closes the attachment.
                Ok(_) => {}
                Err(CallError::WrongState(_)) => {}
                Err(e) => {
                    tracing::error!(%session_id, %user_id, "Failed to end call: {e:#}");
                    let frame = Event::Error {
                        code: 500,
                        message: "Failed to end call".to_string(),
                        server_time: OffsetDateTime::now_utc(),
                    };
                    let _ = send_event(sink, &frame).await;
                }
            }
        }
    }

    ControlFlow::Continue(())
}

pub async fn notifications_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AttachQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| notifications_attachment(socket, state, query.token))
}

/// Per-user notification feed. A listener attaching mid-ring is told about
/// every currently-ringing call immediately.
async fn notifications_attachment(socket: WebSocket, state: Arc<AppState>, token: String) {
    let (mut sink, mut stream) = socket.split();

    let Some(user_id) = authenticate(&mut sink, &state, &token).await else {
        return;
    };

    let mut rx = state.fabric.subscribe(&user_group(user_id));

    if let Err(e) = send_ringing_calls(&mut sink, &state, user_id).await {
        tracing::error!(%user_id, "Failed to send ringing calls on attach: {e:#}");
    }
    let _ = send_event(
        &mut sink,
        &Event::ConversationListChanged {
            server_time: OffsetDateTime::now_utc(),
        },
    )
    .await;

    tracing::debug!(%user_id, "Notification attachment opened");
    relay_user_group(&mut sink, &mut stream, &mut rx, None).await;
    tracing::debug!(%user_id, "Notification attachment closed");
}

pub async fn conversations_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AttachQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| conversations_attachment(socket, state, query.token))
}

/// Read-only projection for the chat feature: pushes a change marker
/// whenever any conversation the user participates in changes.
async fn conversations_attachment(socket: WebSocket, state: Arc<AppState>, token: String) {
    let (mut sink, mut stream) = socket.split();

    let Some(user_id) = authenticate(&mut sink, &state, &token).await else {
        return;
    };

    let mut rx = state.fabric.subscribe(&user_group(user_id));

    let _ = send_event(
        &mut sink,
        &Event::ConversationListChanged {
            server_time: OffsetDateTime::now_utc(),
        },
    )
    .await;

    relay_user_group(
        &mut sink,
        &mut stream,
        &mut rx,
        Some(|event: &Event| matches!(event, Event::ConversationListChanged { .. })),
    )
    .await;
}

/// Shared inbound/outbound loop for the user-group attachments: answers
/// heartbeats, forwards (optionally filtered) group events.
async fn relay_user_group(
    sink: &mut WsSink,
    stream: &mut WsStream,
    rx: &mut broadcast::Receiver<Event>,
    filter: Option<fn(&Event) -> bool>,
) {
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if matches!(serde_json::from_str::<ClientMessage>(&text), Ok(ClientMessage::Ping))
                        && send_event(sink, &Event::Pong).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            event = rx.recv() => match event {
                Ok(event) => {
                    if let Some(filter) = filter {
                        if !filter(&event) {
                            continue;
                        }
                    }
                    if send_event(sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn send_ringing_calls(
    sink: &mut WsSink,
    state: &Arc<AppState>,
    user_id: Uuid,
) -> anyhow::Result<()> {
    let mut conn = state.pool.get()?;

    let Some(user) = db::users::get(&mut conn, user_id)? else {
        return Ok(());
    };
    if user.role != UserRole::Listener {
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    for session in db::sessions::ringing_for_listener(&mut conn, user_id)? {
        let talker_name = db::users::get(&mut conn, session.talker_id)?
            .map(|u| u.name)
            .unwrap_or_default();

        let event = Event::IncomingCall {
            session_id: session.id,
            talker_id: session.talker_id,
            talker_name,
            kind: session.kind.into(),
            total_minutes: session.total_minutes_purchased,
            server_time: now,
        };
        if send_event(sink, &event).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// Verify the query-string bearer token, closing with 4001 on failure.
async fn authenticate(sink: &mut WsSink, state: &Arc<AppState>, token: &str) -> Option<Uuid> {
    let secret = state.settings.read().await.auth_token_secret.clone();
    match auth::verify_token(&secret, token, OffsetDateTime::now_utc()) {
        Ok(user_id) => Some(user_id),
        Err(e) => {
            refuse(sink, close_code::AUTH, &format!("Authentication required: {e}")).await;
            None
        }
    }
}

fn load_session(state: &Arc<AppState>, session_id: Uuid) -> anyhow::Result<Option<Session>> {
    let mut conn = state.pool.get()?;
    Ok(db::sessions::get(&mut conn, session_id)?)
}

fn payment_valid(state: &Arc<AppState>, session: &Session) -> anyhow::Result<bool> {
    let mut conn = state.pool.get()?;
    Ok(session::payment_valid(&mut conn, session)?)
}

async fn send_event(sink: &mut WsSink, event: &Event) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).expect("events to serialize");
    sink.send(Message::Text(json)).await
}

/// Error frame plus a close with the protocol's code.
async fn refuse(sink: &mut WsSink, code: u16, message: &str) {
    let frame = Event::Error {
        code,
        message: message.to_string(),
        server_time: OffsetDateTime::now_utc(),
    };
    let _ = send_event(sink, &frame).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: message.to_string().into(),
        })))
        .await;
}
