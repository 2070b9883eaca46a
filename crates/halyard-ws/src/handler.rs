use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use halyard_core::client_caps::ClientCapabilities;
use halyard_core::dispatch::presence_payload;
use halyard_core::error::ResumeError;
use halyard_core::session::{Session, SessionKind};
use halyard_core::AppState;
use halyard_data::{Account, DataLayer};
use halyard_models::gateway::*;
use halyard_models::intents::Intents;
use halyard_models::permissions::Permissions;
use halyard_models::presence::{Activity, Status};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::compression::WsCompressor;
use crate::encoding::WireEncoding;

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);
const WS_MAX_GLOBAL_CONNECTIONS_DEFAULT: usize = 2_000;
const WS_MAX_CONNECTIONS_PER_USER_DEFAULT: usize = 5;
const WS_MAX_MESSAGES_PER_MINUTE_DEFAULT: u32 = 240;
const WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT: u32 = 60;
const WS_MAX_VOICE_UPDATES_PER_MINUTE_DEFAULT: u32 = 60;
const WS_MAX_LIST_REQUESTS_PER_MINUTE_DEFAULT: u32 = 120;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static USER_CONNECTIONS: OnceLock<dashmap::DashMap<i64, usize>> = OnceLock::new();

fn user_connections() -> &'static dashmap::DashMap<i64, usize> {
    USER_CONNECTIONS.get_or_init(dashmap::DashMap::new)
}

#[derive(Clone, Copy)]
struct WsLimits {
    max_global_connections: usize,
    max_connections_per_user: usize,
    max_messages_per_minute: u32,
    max_presence_updates_per_minute: u32,
    max_voice_updates_per_minute: u32,
    max_list_requests_per_minute: u32,
}

static WS_LIMITS: OnceLock<WsLimits> = OnceLock::new();

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn ws_limits() -> WsLimits {
    *WS_LIMITS.get_or_init(|| WsLimits {
        max_global_connections: env_usize(
            "HALYARD_WS_MAX_CONNECTIONS",
            WS_MAX_GLOBAL_CONNECTIONS_DEFAULT,
        ),
        max_connections_per_user: env_usize(
            "HALYARD_WS_MAX_CONNECTIONS_PER_USER",
            WS_MAX_CONNECTIONS_PER_USER_DEFAULT,
        ),
        max_messages_per_minute: env_u32(
            "HALYARD_WS_MAX_MESSAGES_PER_MINUTE",
            WS_MAX_MESSAGES_PER_MINUTE_DEFAULT,
        ),
        max_presence_updates_per_minute: env_u32(
            "HALYARD_WS_MAX_PRESENCE_UPDATES_PER_MINUTE",
            WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT,
        ),
        max_voice_updates_per_minute: env_u32(
            "HALYARD_WS_MAX_VOICE_UPDATES_PER_MINUTE",
            WS_MAX_VOICE_UPDATES_PER_MINUTE_DEFAULT,
        ),
        max_list_requests_per_minute: env_u32(
            "HALYARD_WS_MAX_LIST_REQUESTS_PER_MINUTE",
            WS_MAX_LIST_REQUESTS_PER_MINUTE_DEFAULT,
        ),
    })
}

fn wire_trace_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("HALYARD_WIRE_TRACE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

fn wire_log_in(user_id: Option<i64>, session_id: Option<&str>, opcode: u8, bytes: usize) {
    if !wire_trace_enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "in",
        user_id = ?user_id,
        session_id = ?session_id,
        opcode,
        bytes,
        "client_frame"
    );
}

fn wire_log_out(
    user_id: Option<i64>,
    session_id: Option<&str>,
    opcode: u8,
    event_type: Option<&str>,
    sequence: Option<u64>,
    bytes: usize,
) {
    if !wire_trace_enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        user_id = ?user_id,
        session_id = ?session_id,
        opcode,
        event_type = ?event_type,
        sequence = ?sequence,
        bytes,
        "server_frame"
    );
}

struct ConnectionGuard {
    user_id: Option<i64>,
    global_acquired: bool,
}

impl ConnectionGuard {
    fn new() -> Self {
        Self {
            user_id: None,
            global_acquired: false,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(user_id) = self.user_id.take() {
            if let Some(mut count) = user_connections().get_mut(&user_id) {
                if *count <= 1 {
                    drop(count);
                    user_connections().remove(&user_id);
                } else {
                    *count -= 1;
                }
            }
        }
        if self.global_acquired {
            ACTIVE_CONNECTIONS.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }
}

fn try_acquire_global_connection_slot() -> bool {
    let limits = ws_limits();
    let mut current = ACTIVE_CONNECTIONS.load(AtomicOrdering::SeqCst);
    loop {
        if current >= limits.max_global_connections {
            return false;
        }
        match ACTIVE_CONNECTIONS.compare_exchange(
            current,
            current + 1,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

fn try_acquire_user_connection_slot(user_id: i64) -> bool {
    let limits = ws_limits();
    let mut count = user_connections().entry(user_id).or_insert(0);
    if *count >= limits.max_connections_per_user {
        return false;
    }
    *count += 1;
    true
}

/// User-level rate limiters shared across all connections for the same
/// user, so opening more tabs buys no extra budget. Heartbeats are never
/// limited; presence/voice/list excess is dropped silently.
struct UserRateLimits {
    messages: DefaultKeyedRateLimiter<i64>,
    presence: DefaultKeyedRateLimiter<i64>,
    voice: DefaultKeyedRateLimiter<i64>,
    list: DefaultKeyedRateLimiter<i64>,
}

static USER_RATE_LIMITS: OnceLock<UserRateLimits> = OnceLock::new();

fn user_rate_limits() -> &'static UserRateLimits {
    USER_RATE_LIMITS.get_or_init(|| {
        let limits = ws_limits();
        let rate_limits = UserRateLimits {
            messages: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_messages_per_minute).unwrap(),
            )),
            presence: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_presence_updates_per_minute).unwrap(),
            )),
            voice: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_voice_updates_per_minute).unwrap(),
            )),
            list: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(limits.max_list_requests_per_minute).unwrap(),
            )),
        };

        // Periodic cleanup of stale keyed entries so the maps stay bounded.
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                let rl = user_rate_limits();
                rl.messages.retain_recent();
                rl.presence.retain_recent();
                rl.voice.retain_recent();
                rl.list.retain_recent();
            }
        });

        rate_limits
    })
}

impl UserRateLimits {
    /// `false` means this opcode must be dropped for this user right now.
    fn allow(&self, user_id: i64, opcode: u8) -> bool {
        if opcode == OP_HEARTBEAT {
            return true;
        }
        if self.messages.check_key(&user_id).is_err() {
            return false;
        }
        let limiter = match opcode {
            OP_PRESENCE_UPDATE => &self.presence,
            OP_VOICE_STATE_UPDATE => &self.voice,
            OP_LAZY_FETCH | OP_MEMBER_CHUNKS => &self.list,
            _ => return true,
        };
        limiter.check_key(&user_id).is_ok()
    }
}

struct Conn {
    encoding: WireEncoding,
    compressor: WsCompressor,
    user_id: Option<i64>,
    session_id: Option<String>,
}

impl Conn {
    async fn send(
        &self,
        sender: &mut (impl SinkExt<Message> + Unpin),
        frame: &GatewayMessage,
    ) -> Result<(), ()> {
        let (bytes, binary) = self.encoding.encode(frame).map_err(|err| {
            tracing::warn!(%err, "outbound frame encode failed");
        })?;
        wire_log_out(
            self.user_id,
            self.session_id.as_deref(),
            frame.op,
            frame.t.as_deref(),
            frame.s,
            bytes.len(),
        );
        let message = match self.compressor.compress(&bytes) {
            Some(Ok(compressed)) => Message::Binary(compressed.into()),
            Some(Err(err)) => {
                tracing::warn!(%err, "zlib-stream compression failed, sending uncompressed");
                if binary {
                    Message::Binary(bytes.into())
                } else {
                    Message::Text(String::from_utf8_lossy(&bytes).into_owned().into())
                }
            }
            None if binary => Message::Binary(bytes.into()),
            None => Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()),
        };
        sender.send(message).await.map_err(|_| ())
    }

    async fn close(
        &self,
        sender: &mut (impl SinkExt<Message> + Unpin),
        code: u16,
        reason: &str,
    ) -> Result<(), ()> {
        tracing::debug!(
            user_id = ?self.user_id,
            session_id = ?self.session_id,
            code,
            reason,
            "closing gateway connection"
        );
        sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await
            .map_err(|_| ())
    }

    fn decode(&self, msg: &Message) -> Option<Value> {
        match msg {
            Message::Text(text) => self.encoding.decode_text(text.as_str()),
            Message::Binary(data) => self.encoding.decode_binary(data.as_ref()),
            _ => None,
        }
    }
}

enum AuthOutcome {
    Identified {
        session: Arc<Session>,
        rx: mpsc::UnboundedReceiver<GatewayMessage>,
        account: Account,
    },
    Resumed {
        session: Arc<Session>,
        rx: mpsc::UnboundedReceiver<GatewayMessage>,
    },
    Closed,
}

pub async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    encoding: WireEncoding,
    compress: bool,
) {
    let mut conn = Conn {
        encoding,
        compressor: WsCompressor::new(compress),
        user_id: None,
        session_id: None,
    };
    let mut connection_guard = ConnectionGuard::new();
    let (mut sender, mut receiver) = socket.split();

    if !try_acquire_global_connection_slot() {
        let _ = conn
            .close(&mut sender, 1013, "Gateway is at connection capacity")
            .await;
        return;
    }
    connection_guard.global_acquired = true;

    // HELLO carries the heartbeat contract.
    let hello = GatewayMessage::with_data(
        OP_HEARTBEAT_INFO,
        json!({ "heartbeat_interval": state.config.heartbeat_interval.as_millis() as u64 }),
    );
    if conn.send(&mut sender, &hello).await.is_err() {
        return;
    }

    let auth = match tokio::time::timeout(
        IDENTIFY_TIMEOUT,
        authenticate(&mut conn, &mut sender, &mut receiver, &state),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            let _ = conn
                .send(
                    &mut sender,
                    &GatewayMessage::with_data(OP_INVALID_SESSION, json!(false)),
                )
                .await;
            return;
        }
    };

    let (session, rx, fresh_account) = match auth {
        AuthOutcome::Identified {
            session,
            rx,
            account,
        } => (session, rx, Some(account)),
        AuthOutcome::Resumed { session, rx } => (session, rx, None),
        AuthOutcome::Closed => return,
    };

    if !try_acquire_user_connection_slot(session.user_id) {
        let _ = conn
            .close(&mut sender, 1008, "Too many concurrent sessions for this user")
            .await;
        // Never identified into the registry on this path for fresh
        // sessions; resumed sessions return to their grace window.
        if fresh_account.is_none() {
            state.dispatcher.handle_disconnect(&session);
        }
        return;
    }
    connection_guard.user_id = Some(session.user_id);
    conn.user_id = Some(session.user_id);
    conn.session_id = Some(session.id.clone());

    if let Some(account) = fresh_account {
        let ready = build_ready_payload(&state, &session, &account).await;
        state.registry.insert(session.clone());
        session.mark_ready(ready);
        state.dispatcher.broadcast_presence(session.user_id).await;
        tracing::info!(
            session_id = %session.id,
            user_id = session.user_id,
            bot = account.bot,
            "session identified"
        );
    }

    let timed_out = run_session(&mut conn, sender, receiver, rx, &session, &state).await;

    if timed_out {
        // Fatal timeout: no resume grace, the session is gone now.
        session.mark_closed();
        state.dispatcher.terminate(&session.id).await;
        tracing::warn!(
            session_id = %session.id,
            user_id = session.user_id,
            "connection closed: heartbeat timeout"
        );
    } else {
        state.dispatcher.handle_disconnect(&session);
        tracing::info!(
            session_id = %session.id,
            user_id = session.user_id,
            "connection closed: awaiting resume"
        );
    }
}

/// Pre-auth phase: only IDENTIFY, RESUME and HEARTBEAT are legal. A
/// failed resume signals invalid-session and keeps waiting so the client
/// can fall back to a fresh identify on the same socket.
async fn authenticate(
    conn: &mut Conn,
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
) -> AuthOutcome {
    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            continue;
        }
        if matches!(msg, Message::Close(_)) {
            return AuthOutcome::Closed;
        }
        let frame_bytes = frame_len(&msg);
        let Some(payload) = conn.decode(&msg) else {
            let _ = conn
                .close(sender, CLOSE_INVALID_PAYLOAD, "Malformed frame")
                .await;
            return AuthOutcome::Closed;
        };
        let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;
        wire_log_in(None, None, op, frame_bytes);
        let data = payload.get("d").cloned().unwrap_or(Value::Null);

        match op {
            OP_HEARTBEAT => {
                let _ = conn
                    .send(sender, &GatewayMessage::op_only(OP_HEARTBEAT_ACK))
                    .await;
            }
            OP_IDENTIFY => {
                let Some(token) = data.get("token").and_then(|v| v.as_str()) else {
                    let _ = conn
                        .close(sender, CLOSE_AUTHENTICATION_FAILED, "Authentication failed")
                        .await;
                    return AuthOutcome::Closed;
                };
                let account = match state.data.get_account_by_token(token).await {
                    Ok(Some(account)) => account,
                    Ok(None) => {
                        let _ = conn
                            .close(sender, CLOSE_AUTHENTICATION_FAILED, "Authentication failed")
                            .await;
                        return AuthOutcome::Closed;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "identify: data layer failed");
                        let _ = conn
                            .close(sender, CLOSE_AUTHENTICATION_FAILED, "Authentication failed")
                            .await;
                        return AuthOutcome::Closed;
                    }
                };

                let kind = match data.get("connection_type").and_then(|v| v.as_str()) {
                    Some("voice") => SessionKind::Voice,
                    _ => SessionKind::Gateway,
                };
                let intents = data
                    .get("intents")
                    .and_then(|v| v.as_u64())
                    .map(Intents::from_bits_truncate)
                    .unwrap_or(if account.bot {
                        state.config.default_bot_intents
                    } else {
                        state.config.default_user_intents
                    });
                let caps = ClientCapabilities::from_identify(&data);
                let guild_ids: Vec<i64> = match state.data.get_users_guilds(account.user.id).await
                {
                    Ok(guilds) => guilds.iter().map(|g| g.id).collect(),
                    Err(err) => {
                        tracing::warn!(%err, "identify: guild snapshot failed");
                        Vec::new()
                    }
                };

                let (tx, rx) = mpsc::unbounded_channel();
                let session = Arc::new(Session::new(
                    account.user.id,
                    kind,
                    intents,
                    caps,
                    guild_ids,
                    tx,
                    state.config.replay_capacity,
                ));
                return AuthOutcome::Identified {
                    session,
                    rx,
                    account,
                };
            }
            OP_RESUME => {
                let (Some(token), Some(session_id)) = (
                    data.get("token").and_then(|v| v.as_str()),
                    data.get("session_id").and_then(|v| v.as_str()),
                ) else {
                    let _ = conn
                        .close(sender, CLOSE_INVALID_SEQUENCE, "Malformed resume")
                        .await;
                    return AuthOutcome::Closed;
                };
                let Some(seq) = data.get("seq").and_then(|v| v.as_u64()) else {
                    let _ = conn
                        .close(sender, CLOSE_INVALID_SEQUENCE, "Malformed resume")
                        .await;
                    return AuthOutcome::Closed;
                };

                let account = match state.data.get_account_by_token(token).await {
                    Ok(Some(account)) => account,
                    _ => {
                        let _ = conn
                            .close(sender, CLOSE_AUTHENTICATION_FAILED, "Authentication failed")
                            .await;
                        return AuthOutcome::Closed;
                    }
                };

                let existing = state
                    .registry
                    .get(session_id)
                    .filter(|s| s.user_id == account.user.id);
                let Some(existing) = existing else {
                    // Unknown or expired session: recoverable, the client
                    // should identify fresh.
                    let _ = conn
                        .send(
                            sender,
                            &GatewayMessage::with_data(OP_INVALID_SESSION, json!(false)),
                        )
                        .await;
                    continue;
                };

                let (tx, rx) = mpsc::unbounded_channel();
                match existing.resume(seq, tx) {
                    Ok(replayed) => {
                        tracing::info!(
                            session_id = %existing.id,
                            user_id = existing.user_id,
                            replayed_events = replayed,
                            "session resumed"
                        );
                        return AuthOutcome::Resumed {
                            session: existing,
                            rx,
                        };
                    }
                    Err(ResumeError::NotDisconnected) => {
                        let _ = conn
                            .close(sender, CLOSE_ALREADY_IDENTIFIED, "Session is live elsewhere")
                            .await;
                        return AuthOutcome::Closed;
                    }
                    Err(ResumeError::InvalidSession) => {
                        let _ = conn
                            .send(
                                sender,
                                &GatewayMessage::with_data(OP_INVALID_SESSION, json!(false)),
                            )
                            .await;
                        continue;
                    }
                }
            }
            _ => {
                let _ = conn
                    .close(sender, CLOSE_NOT_AUTHENTICATED, "Not authenticated")
                    .await;
                return AuthOutcome::Closed;
            }
        }
    }
    AuthOutcome::Closed
}

/// Post-auth select loop. Returns true when the connection died of a
/// heartbeat timeout rather than a client-initiated close.
async fn run_session(
    conn: &mut Conn,
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    mut rx: mpsc::UnboundedReceiver<GatewayMessage>,
    session: &Arc<Session>,
    state: &AppState,
) -> bool {
    let deadline = state.config.heartbeat_deadline();
    let rate_limits = user_rate_limits();
    let heartbeat_sleep = tokio::time::sleep(deadline);
    tokio::pin!(heartbeat_sleep);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if matches!(msg, Message::Close(_)) {
                            return false;
                        }
                        if matches!(msg, Message::Ping(_) | Message::Pong(_)) {
                            continue;
                        }
                        let frame_bytes = frame_len(&msg);
                        let Some(payload) = conn.decode(&msg) else {
                            let _ = conn.close(&mut sender, CLOSE_INVALID_PAYLOAD, "Malformed frame").await;
                            return false;
                        };
                        let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;
                        wire_log_in(
                            Some(session.user_id),
                            Some(session.id.as_str()),
                            op,
                            frame_bytes,
                        );
                        session.touch();
                        if !rate_limits.allow(session.user_id, op) {
                            tracing::debug!(user_id = session.user_id, opcode = op, "rate limited (silent drop)");
                            continue;
                        }
                        if op == OP_HEARTBEAT {
                            heartbeat_sleep.as_mut().reset(Instant::now() + deadline);
                        }
                        if matches!(op, OP_IDENTIFY | OP_RESUME) {
                            let _ = conn.close(&mut sender, CLOSE_ALREADY_IDENTIFIED, "Already identified").await;
                            return false;
                        }
                        let data = payload.get("d").cloned().unwrap_or(Value::Null);
                        handle_opcode(conn, &mut sender, op, data, session, state).await;
                    }
                    Some(Err(_)) | None => return false,
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if conn.send(&mut sender, &frame).await.is_err() {
                            return false;
                        }
                    }
                    // All senders dropped: the session was closed under us.
                    None => return false,
                }
            }
            () = &mut heartbeat_sleep => {
                let _ = conn.close(&mut sender, CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout").await;
                return true;
            }
        }
    }
}

async fn handle_opcode(
    conn: &mut Conn,
    sender: &mut (impl SinkExt<Message> + Unpin),
    op: u8,
    data: Value,
    session: &Arc<Session>,
    state: &AppState,
) {
    match op {
        OP_HEARTBEAT => {
            let _ = conn
                .send(sender, &GatewayMessage::op_only(OP_HEARTBEAT_ACK))
                .await;
        }
        OP_PRESENCE_UPDATE => {
            let status = data
                .get("status")
                .and_then(|v| v.as_str())
                .and_then(Status::parse)
                .unwrap_or(Status::Online);
            let activities = parse_activities(data.get("activities"));
            session.set_presence(status, activities);
            let settings = halyard_data::UserSettings {
                status: status.as_str().to_string(),
                custom_status: data
                    .get("custom_status")
                    .and_then(|v| v.as_str())
                    .map(|s| truncate(s, MAX_ACTIVITY_TEXT_LEN)),
            };
            if let Err(err) = state.data.update_settings(session.user_id, settings).await {
                tracing::warn!(user_id = session.user_id, %err, "presence persistence failed");
            }
            state.dispatcher.broadcast_presence(session.user_id).await;
        }
        OP_VOICE_STATE_UPDATE => {
            handle_voice_state_update(data, session, state).await;
        }
        OP_TYPING_START => {
            handle_typing_start(data, session, state).await;
        }
        OP_LAZY_FETCH => {
            handle_lazy_fetch(data, session, state).await;
        }
        OP_MEMBER_CHUNKS => {
            handle_member_chunks(data, session, state).await;
        }
        _ => {
            tracing::debug!(opcode = op, user_id = session.user_id, "unknown opcode");
        }
    }
}

async fn handle_voice_state_update(data: Value, session: &Arc<Session>, state: &AppState) {
    let guild_id = data
        .get("guild_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok());
    let channel_id = data
        .get("channel_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok());
    let self_mute = data
        .get("self_mute")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let self_deaf = data
        .get("self_deaf")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let Some(guild_id) = guild_id else {
        return;
    };

    // Joining a channel requires the member to be able to see and
    // connect to it; leaving (null channel) is always allowed.
    if let Some(channel_id) = channel_id {
        let Ok(Some(guild)) = state.data.get_guild_by_id(guild_id).await else {
            return;
        };
        let Some(channel) = guild.channel(channel_id) else {
            return;
        };
        let perms =
            halyard_core::permissions::compute_channel_permissions(&guild, channel, session.user_id);
        if !perms.contains(Permissions::VIEW_CHANNEL) || !perms.contains(Permissions::CONNECT) {
            return;
        }
    }

    let payload = json!({
        "user_id": session.user_id.to_string(),
        "session_id": session.id,
        "guild_id": guild_id.to_string(),
        "channel_id": channel_id.map(|id| id.to_string()),
        "self_mute": self_mute,
        "self_deaf": self_deaf,
    });
    state
        .dispatcher
        .to_guild(guild_id, EVENT_VOICE_STATE_UPDATE, &payload.into())
        .await;
}

async fn handle_typing_start(data: Value, session: &Arc<Session>, state: &AppState) {
    let Some(channel_id) = data
        .get("channel_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return;
    };
    let guild_id = data
        .get("guild_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok());

    let timestamp = chrono::Utc::now().timestamp();
    match guild_id {
        Some(guild_id) => {
            let Ok(Some(guild)) = state.data.get_guild_by_id(guild_id).await else {
                return;
            };
            let Some(channel) = guild.channel(channel_id) else {
                return;
            };
            let perms = halyard_core::permissions::compute_channel_permissions(
                &guild,
                channel,
                session.user_id,
            );
            if !perms.contains(Permissions::VIEW_CHANNEL)
                || !perms.contains(Permissions::SEND_MESSAGES)
            {
                return;
            }
            let payload = json!({
                "channel_id": channel_id.to_string(),
                "guild_id": guild_id.to_string(),
                "user_id": session.user_id.to_string(),
                "timestamp": timestamp,
            });
            state
                .dispatcher
                .to_channel(guild_id, channel_id, EVENT_TYPING_START, &payload.into())
                .await;
        }
        None => {
            let payload = json!({
                "channel_id": channel_id.to_string(),
                "user_id": session.user_id.to_string(),
                "timestamp": timestamp,
            });
            state
                .dispatcher
                .to_private_channel(channel_id, EVENT_TYPING_START, &payload.into())
                .await;
        }
    }
}

/// Bulk roster/presence fetch: answers only the requesting session with
/// a GUILD_MEMBERS_CHUNK.
async fn handle_lazy_fetch(data: Value, session: &Arc<Session>, state: &AppState) {
    let Some(guild_id) = data
        .get("guild_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return;
    };
    let Ok(Some(guild)) = state.data.get_guild_by_id(guild_id).await else {
        return;
    };
    if !guild.is_member(session.user_id) {
        return;
    }

    let requested: Option<Vec<i64>> = data.get("user_ids").and_then(|v| v.as_array()).map(|ids| {
        ids.iter()
            .filter_map(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()))
            .collect()
    });

    let members: Vec<&halyard_models::member::Member> = guild
        .members
        .iter()
        .filter(|m| match &requested {
            Some(ids) => ids.contains(&m.user.id),
            None => true,
        })
        .collect();
    let presences: Vec<Value> = members
        .iter()
        .map(|m| {
            let presence = state.registry.visible_presence(m.user.id);
            presence_payload(&presence, Some(guild_id))
        })
        .collect();

    let chunk = json!({
        "guild_id": guild_id.to_string(),
        "members": members,
        "presences": presences,
    });
    session.dispatch(EVENT_GUILD_MEMBERS_CHUNK, &chunk.into());
}

/// Member-list subscription request: ranges per channel, plus an
/// optional explicit member-id list for out-of-window presence refresh.
async fn handle_member_chunks(data: Value, session: &Arc<Session>, state: &AppState) {
    let Some(guild_id) = data
        .get("guild_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return;
    };

    let mut channel_ranges: HashMap<i64, Vec<(u64, u64)>> = HashMap::new();
    if let Some(channels) = data.get("channels").and_then(|v| v.as_object()) {
        for (raw_id, raw_ranges) in channels {
            let Ok(channel_id) = raw_id.parse::<i64>() else {
                continue;
            };
            let ranges: Vec<(u64, u64)> = raw_ranges
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| {
                            let pair = entry.as_array()?;
                            let start = pair.first()?.as_u64()?;
                            let end = pair.get(1)?.as_u64()?;
                            (start <= end).then_some((start, end))
                        })
                        .collect()
                })
                .unwrap_or_default();
            if !ranges.is_empty() {
                channel_ranges.insert(channel_id, ranges);
            }
        }
    }
    if channel_ranges.is_empty() {
        return;
    }

    let member_ids: Option<Vec<i64>> = data.get("members").and_then(|v| v.as_array()).map(|ids| {
        ids.iter()
            .filter_map(|v| v.as_str().and_then(|s| s.parse::<i64>().ok()))
            .collect()
    });

    state
        .dispatcher
        .subscribe_member_list(session, guild_id, &channel_ranges, member_ids.as_deref())
        .await;
}

fn frame_len(msg: &Message) -> usize {
    match msg {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

const MAX_ACTIVITY_ITEMS: usize = 8;
const MAX_ACTIVITY_TEXT_LEN: usize = 256;

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn parse_activities(raw: Option<&Value>) -> Vec<Activity> {
    let Some(Value::Array(list)) = raw else {
        return Vec::new();
    };
    list.iter()
        .take(MAX_ACTIVITY_ITEMS)
        .filter_map(|entry| {
            let obj = entry.as_object()?;
            Some(Activity {
                name: obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| truncate(s, MAX_ACTIVITY_TEXT_LEN))
                    .unwrap_or_else(|| "Unknown".to_string()),
                activity_type: obj
                    .get("type")
                    .or_else(|| obj.get("activity_type"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0) as i32,
                details: obj
                    .get("details")
                    .and_then(|v| v.as_str())
                    .map(|s| truncate(s, MAX_ACTIVITY_TEXT_LEN)),
                state: obj
                    .get("state")
                    .and_then(|v| v.as_str())
                    .map(|s| truncate(s, MAX_ACTIVITY_TEXT_LEN)),
            })
        })
        .collect()
}

async fn build_ready_payload(state: &AppState, session: &Arc<Session>, account: &Account) -> Value {
    let user_json = json!({
        "id": account.user.id.to_string(),
        "username": account.user.username,
        "discriminator": account.user.discriminator,
        "avatar": account.user.avatar,
        "bot": account.bot,
    });

    let guilds = match state.data.get_users_guilds(session.user_id).await {
        Ok(guilds) => guilds,
        Err(err) => {
            tracing::warn!(user_id = session.user_id, %err, "ready: guild snapshot failed");
            Vec::new()
        }
    };
    let guilds_json: Vec<Value> = guilds
        .iter()
        .map(|guild| {
            let presences: Vec<Value> = guild
                .members
                .iter()
                .filter_map(|m| {
                    let presence = state.registry.visible_presence(m.user.id);
                    if presence.status == Status::Offline {
                        return None;
                    }
                    Some(presence_payload(&presence, Some(guild.id)))
                })
                .collect();
            json!({
                "id": guild.id.to_string(),
                "name": guild.name,
                "owner_id": guild.owner_id.to_string(),
                "member_count": guild.members.len(),
                "channels": guild.channels,
                "presences": presences,
                "lazy": true,
            })
        })
        .collect();

    let read_states = match state.data.get_latest_acknowledgements(session.user_id).await {
        Ok(states) => states,
        Err(err) => {
            tracing::warn!(user_id = session.user_id, %err, "ready: read states failed");
            Vec::new()
        }
    };

    json!({
        "user": user_json,
        "session_id": session.id,
        "guilds": guilds_json,
        "read_states": read_states,
    })
}
