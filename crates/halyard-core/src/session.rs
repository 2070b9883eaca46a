//! Per-connection protocol state: identity, sequence counter, bounded
//! replay ring, presence, list subscriptions, and the dead/resume
//! lifecycle.
//!
//! A `Session` is shared as `Arc<Session>` between its owning connection
//! task and the dispatcher. All mutable state sits behind one mutex so
//! sequence assignment and outbound enqueueing are serialized per
//! session; the socket write itself happens on the connection task, fed
//! by the outbound channel, which preserves order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use halyard_models::gateway::{GatewayMessage, EVENT_PRESENCE_UPDATE, EVENT_READY, EVENT_RESUMED};
use halyard_models::intents::Intents;
use halyard_models::presence::{Presence, Status};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::client_caps::ClientCapabilities;
use crate::error::ResumeError;
use crate::intents::{redact_message_content, required_intent, requires_content_redaction};
use crate::member_list::ListItem;

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Real-time event delivery connection.
    Gateway,
    /// Voice/media signaling connection: shares the indices and timeout
    /// discipline but never receives filtered fan-out events.
    Voice,
}

/// Outbound payloads are either a fixed value shared by every recipient
/// or a per-recipient computation (redacted content, a list diff).
#[derive(Clone)]
pub enum EventPayload {
    Fixed(Value),
    Computed(Arc<dyn Fn(&Session) -> Option<Value> + Send + Sync>),
}

impl EventPayload {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Session) -> Option<Value> + Send + Sync + 'static,
    {
        EventPayload::Computed(Arc::new(f))
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        EventPayload::Fixed(value)
    }
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::Fixed(v) => f.debug_tuple("Fixed").field(v).finish(),
            EventPayload::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Whether a dispatch call actually enqueued a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub sequence: u64,
    pub event_type: String,
    pub payload: Value,
}

/// Requested ranges and the previously emitted item array, per channel,
/// for one guild's live member list.
#[derive(Debug, Default)]
pub struct GuildSubscription {
    pub ranges: HashMap<i64, Vec<(u64, u64)>>,
    pub cached_items: HashMap<i64, Vec<ListItem>>,
}

struct SessionInner {
    ready: bool,
    dead: bool,
    terminated: bool,
    sequence: u64,
    replay: VecDeque<BufferedEvent>,
    outbound: Option<mpsc::UnboundedSender<GatewayMessage>>,
    presence: Presence,
    last_active: Instant,
    guild_ids: Vec<i64>,
    subscriptions: HashMap<i64, GuildSubscription>,
    termination: Option<AbortHandle>,
}

pub struct Session {
    pub id: SessionId,
    pub user_id: i64,
    pub kind: SessionKind,
    pub intents: Intents,
    pub caps: ClientCapabilities,
    replay_capacity: usize,
    inner: Mutex<SessionInner>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        kind: SessionKind,
        intents: Intents,
        caps: ClientCapabilities,
        guild_ids: Vec<i64>,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
        replay_capacity: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            kind,
            intents,
            caps,
            replay_capacity,
            inner: Mutex::new(SessionInner {
                ready: false,
                dead: false,
                terminated: false,
                sequence: 0,
                replay: VecDeque::new(),
                outbound: Some(outbound),
                presence: Presence::online(user_id),
                last_active: Instant::now(),
                guild_ids,
                subscriptions: HashMap::new(),
                termination: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // Lock poisoning would mean a panic mid-update; propagating it
        // here would only cascade, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark the session live and emit its initial full-state event. The
    /// READY dispatch is the only event exempt from intent filtering.
    pub fn mark_ready(&self, ready_payload: Value) -> Delivery {
        let mut inner = self.lock();
        inner.ready = true;
        push_and_send(&mut inner, self.replay_capacity, EVENT_READY, ready_payload)
    }

    /// Deliver one event to this session, applying intent gating and
    /// content redaction. No-op while not ready or dead, and always a
    /// no-op for voice sessions.
    pub fn dispatch(&self, event_type: &str, payload: &EventPayload) -> Delivery {
        if self.kind == SessionKind::Voice {
            return Delivery::Skipped;
        }
        // Deferred payloads run outside the state lock; they may re-enter
        // session accessors.
        let evaluated = match payload {
            EventPayload::Fixed(v) => v.clone(),
            EventPayload::Computed(f) => match f(self) {
                Some(v) => v,
                None => return Delivery::Skipped,
            },
        };

        let mut inner = self.lock();
        if !inner.ready || inner.dead {
            return Delivery::Skipped;
        }
        if let Some(required) = required_intent(event_type, &evaluated) {
            if !self.intents.contains(required) {
                return Delivery::Skipped;
            }
        }
        let mut out = evaluated;
        if requires_content_redaction(event_type, self.intents) {
            redact_message_content(&mut out);
        }
        if event_type == EVENT_PRESENCE_UPDATE {
            self.caps.coarsen_presence_payload(&mut out);
        }
        push_and_send(&mut inner, self.replay_capacity, event_type, out)
    }

    /// Reset the activity clock. Called on every inbound opcode.
    pub fn touch(&self) {
        self.lock().last_active = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        self.lock().last_active
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_dead(&self) -> bool {
        self.lock().dead
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn presence(&self) -> Presence {
        self.lock().presence.clone()
    }

    pub fn set_presence(&self, status: Status, activities: Vec<halyard_models::presence::Activity>) {
        let mut inner = self.lock();
        inner.presence.status = status;
        inner.presence.activities = activities;
        inner.presence.since = if status == Status::Idle {
            Some(chrono::Utc::now())
        } else {
            None
        };
    }

    pub fn guild_ids(&self) -> Vec<i64> {
        self.lock().guild_ids.clone()
    }

    pub fn add_guild(&self, guild_id: i64) {
        let mut inner = self.lock();
        if !inner.guild_ids.contains(&guild_id) {
            inner.guild_ids.push(guild_id);
        }
    }

    pub fn remove_guild(&self, guild_id: i64) {
        let mut inner = self.lock();
        inner.guild_ids.retain(|&g| g != guild_id);
        inner.subscriptions.remove(&guild_id);
    }

    /// Socket went away: stop accepting events and wait for a resume.
    /// The caller is responsible for scheduling the termination timer.
    pub fn mark_closed(&self) {
        let mut inner = self.lock();
        inner.dead = true;
        inner.ready = false;
        inner.outbound = None;
    }

    pub fn set_termination_handle(&self, handle: AbortHandle) {
        let mut inner = self.lock();
        if let Some(previous) = inner.termination.take() {
            previous.abort();
        }
        inner.termination = Some(handle);
    }

    /// Reattach a new socket and replay everything after `seq`.
    ///
    /// Fails with `InvalidSession` when the requested sequence has been
    /// evicted from the replay ring or never existed; the caller must
    /// signal invalid-session and leave the connection open for a fresh
    /// identify.
    pub fn resume(
        &self,
        seq: u64,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
    ) -> Result<usize, ResumeError> {
        let mut inner = self.lock();
        // Termination is irreversible; a stale handle cannot revive it.
        if inner.terminated {
            return Err(ResumeError::InvalidSession);
        }
        if !inner.dead {
            return Err(ResumeError::NotDisconnected);
        }
        if seq > inner.sequence {
            return Err(ResumeError::InvalidSession);
        }
        let resumable = match inner.replay.front() {
            Some(oldest) => seq + 1 >= oldest.sequence,
            None => seq == inner.sequence,
        };
        if !resumable {
            return Err(ResumeError::InvalidSession);
        }

        if let Some(handle) = inner.termination.take() {
            handle.abort();
        }
        inner.dead = false;
        inner.ready = true;
        inner.outbound = Some(outbound.clone());

        let mut replayed = 0;
        for event in inner.replay.iter().filter(|e| e.sequence > seq) {
            let frame =
                GatewayMessage::dispatch(&event.event_type, event.sequence, event.payload.clone());
            if outbound.send(frame).is_err() {
                break;
            }
            replayed += 1;
        }
        push_and_send(
            &mut inner,
            self.replay_capacity,
            EVENT_RESUMED,
            json!({ "session_id": self.id }),
        );
        Ok(replayed)
    }

    /// Terminal check: still dead once the grace window elapsed? A resume
    /// in the meantime cancels termination.
    pub fn terminable(&self) -> bool {
        let inner = self.lock();
        inner.dead && !inner.terminated
    }

    pub fn mark_terminated(&self) {
        self.lock().terminated = true;
    }

    // ── Member-list subscription state ────────────────────────────────

    pub fn set_list_subscription(&self, guild_id: i64, channel_id: i64, ranges: Vec<(u64, u64)>) {
        let mut inner = self.lock();
        inner
            .subscriptions
            .entry(guild_id)
            .or_default()
            .ranges
            .insert(channel_id, ranges);
    }

    pub fn has_list_subscription(&self, guild_id: i64) -> bool {
        self.lock().subscriptions.contains_key(&guild_id)
    }

    pub fn subscribed_channels(&self, guild_id: i64) -> Vec<(i64, Vec<(u64, u64)>)> {
        self.lock()
            .subscriptions
            .get(&guild_id)
            .map(|s| s.ranges.iter().map(|(&c, r)| (c, r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn cached_list_items(&self, guild_id: i64, channel_id: i64) -> Option<Vec<ListItem>> {
        self.lock()
            .subscriptions
            .get(&guild_id)
            .and_then(|s| s.cached_items.get(&channel_id).cloned())
    }

    pub fn store_list_items(&self, guild_id: i64, channel_id: i64, items: Vec<ListItem>) {
        self.lock()
            .subscriptions
            .entry(guild_id)
            .or_default()
            .cached_items
            .insert(channel_id, items);
    }

    #[cfg(test)]
    pub fn buffered_sequences(&self) -> Vec<u64> {
        self.lock().replay.iter().map(|e| e.sequence).collect()
    }
}

fn push_and_send(
    inner: &mut SessionInner,
    capacity: usize,
    event_type: &str,
    payload: Value,
) -> Delivery {
    inner.sequence += 1;
    let sequence = inner.sequence;
    inner.replay.push_back(BufferedEvent {
        sequence,
        event_type: event_type.to_string(),
        payload: payload.clone(),
    });
    while inner.replay.len() > capacity {
        inner.replay.pop_front();
    }
    let Some(outbound) = inner.outbound.as_ref() else {
        return Delivery::Skipped;
    };
    match outbound.send(GatewayMessage::dispatch(event_type, sequence, payload)) {
        Ok(()) => Delivery::Sent,
        Err(_) => {
            // Receiver side hung up; the connection task will notice and
            // run the close path.
            Delivery::Skipped
        }
    }
}
