//! Fan-out layer: resolves the recipient session set for each target
//! shape and delivers through `Session::dispatch`, consulting the
//! permission engine and the member-list engine along the way.
//!
//! Failure semantics: a missing guild, user or channel is "nothing to
//! deliver"; a data-layer failure degrades the affected step to zero
//! recipients; one dead socket never aborts delivery to the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use halyard_data::DataLayer;
use halyard_models::channel::Channel;
use halyard_models::gateway::{EVENT_GUILD_MEMBER_LIST_UPDATE, EVENT_PRESENCE_UPDATE};
use halyard_models::guild::Guild;
use halyard_models::permissions::Permissions;
use halyard_models::presence::{Presence, Status};
use serde_json::{json, Value};

use crate::member_list::{self, ListItem, ListOp};
use crate::permissions::{compute_channel_permissions, has_guild_permission};
use crate::registry::SessionRegistry;
use crate::session::{EventPayload, Session, SessionKind};
use crate::GatewayConfig;

const PERMISSION_CACHE_MAX_ENTRIES: u64 = 10_000;
const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    data: Arc<dyn DataLayer>,
    config: Arc<GatewayConfig>,
    /// Computed channel permissions: (channel_id, user_id) -> Permissions.
    permission_cache: moka::sync::Cache<(i64, i64), Permissions>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        data: Arc<dyn DataLayer>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            registry,
            data,
            config,
            permission_cache: moka::sync::Cache::builder()
                .max_capacity(PERMISSION_CACHE_MAX_ENTRIES)
                .time_to_live(PERMISSION_CACHE_TTL)
                .build(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    // ── Fan-out entry points ──────────────────────────────────────────

    /// Deliver to every live session owned by one user (all devices).
    pub fn to_user(&self, user_id: i64, event_type: &str, payload: &EventPayload) {
        for session in self.registry.live_sessions_for_user(user_id) {
            session.dispatch(event_type, payload);
        }
    }

    /// Deliver to every member's live sessions in a guild.
    pub async fn to_guild(&self, guild_id: i64, event_type: &str, payload: &EventPayload) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        for member in &guild.members {
            self.to_user(member.user.id, event_type, payload);
        }
    }

    /// As `to_guild`, but each member must hold the given guild-level
    /// permission. Owners are never filtered.
    pub async fn to_guild_filtered(
        &self,
        guild_id: i64,
        required: Permissions,
        event_type: &str,
        payload: &EventPayload,
    ) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        for member in &guild.members {
            if !has_guild_permission(&guild, member.user.id, required) {
                continue;
            }
            self.to_user(member.user.id, event_type, payload);
        }
    }

    /// Deliver to members able to read one specific channel.
    pub async fn to_channel(
        &self,
        guild_id: i64,
        channel_id: i64,
        event_type: &str,
        payload: &EventPayload,
    ) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        let Some(channel) = guild.channel(channel_id) else {
            tracing::debug!(guild_id, channel_id, "channel fan-out: unknown channel");
            return;
        };
        for member in &guild.members {
            if !self
                .channel_permissions(&guild, channel, member.user.id)
                .contains(Permissions::VIEW_CHANNEL)
            {
                continue;
            }
            self.to_user(member.user.id, event_type, payload);
        }
    }

    /// Deliver to the fixed recipient set of a direct/group conversation,
    /// independent of guild membership.
    pub async fn to_private_channel(
        &self,
        channel_id: i64,
        event_type: &str,
        payload: &EventPayload,
    ) {
        let recipients = match self.data.get_private_channel_recipients(channel_id).await {
            Ok(Some(recipients)) => recipients,
            Ok(None) => {
                tracing::debug!(channel_id, "private fan-out: unknown channel");
                return;
            }
            Err(err) => {
                tracing::warn!(channel_id, %err, "private fan-out: data layer failed");
                return;
            }
        };
        for user_id in recipients {
            self.to_user(user_id, event_type, payload);
        }
    }

    /// Deliver only to sessions holding an active member-list
    /// subscription for the guild. Each such session first gets a full
    /// member-list resync for its subscribed ranges, keeping the sidebar
    /// consistent with whatever change triggered the broadcast, then the
    /// nominal event.
    pub async fn to_subscribers(&self, guild_id: i64, event_type: &str, payload: &EventPayload) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        let presences = self.presence_map(&guild);
        for session in self.subscriber_sessions(guild_id) {
            self.resync_session_lists(&guild, &presences, &session);
            session.dispatch(event_type, payload);
        }
    }

    // ── Lazy member-list paths ────────────────────────────────────────

    /// Register a session's member-list subscription and immediately
    /// serve the requested ranges. Optionally refreshes presence for an
    /// explicit set of member ids the client already has cached.
    pub async fn subscribe_member_list(
        &self,
        session: &Arc<Session>,
        guild_id: i64,
        channel_ranges: &HashMap<i64, Vec<(u64, u64)>>,
        member_ids: Option<&[i64]>,
    ) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        if !guild.is_member(session.user_id) {
            tracing::debug!(
                guild_id,
                user_id = session.user_id,
                "list subscription from non-member dropped"
            );
            return;
        }
        let presences = self.presence_map(&guild);
        for (&channel_id, ranges) in channel_ranges {
            let Some(channel) = guild.channel(channel_id) else {
                continue;
            };
            if !compute_channel_permissions(&guild, channel, session.user_id)
                .contains(Permissions::VIEW_CHANNEL)
            {
                continue;
            }
            session.set_list_subscription(guild_id, channel_id, ranges.clone());
            let items = member_list::compute_items(&guild, channel, &presences);
            let ops = member_list::sync_ops(&items, ranges);
            let payload = list_update_payload(&guild, channel, &items, ops);
            session.dispatch(EVENT_GUILD_MEMBER_LIST_UPDATE, &payload.into());
            session.store_list_items(guild_id, channel_id, items);
        }

        // Out-of-window presence refresh for members the client names.
        if let Some(member_ids) = member_ids {
            for &user_id in member_ids {
                if !guild.is_member(user_id) {
                    continue;
                }
                let presence = self.registry.visible_presence(user_id);
                let payload = presence_payload(&presence, Some(guild_id));
                session.dispatch(EVENT_PRESENCE_UPDATE, &payload.into());
            }
        }
    }

    /// Membership addition: widen the user's session scopes and emit
    /// incremental list updates to subscribers.
    pub async fn member_added(&self, guild_id: i64, user_id: i64) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        for session in self.registry.sessions_for_user(user_id) {
            session.add_guild(guild_id);
        }
        self.resync_lists_for_member(&guild, user_id);
    }

    /// Departure: narrow the user's session scopes, then update lists
    /// against an in-hand copy of the snapshot without the member (it
    /// may still contain them).
    pub async fn member_removed(&self, guild_id: i64, user_id: i64) {
        let Some(mut guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        guild.members.retain(|m| m.user.id != user_id);
        for session in self.registry.sessions_for_user(user_id) {
            session.remove_guild(guild_id);
        }
        self.resync_lists_for_member(&guild, user_id);
    }

    /// Incremental list update after a presence change, the changed
    /// member located by user id. Computed independently per session
    /// since each may hold different range subscriptions.
    pub async fn sync_member_list(&self, guild_id: i64, user_id: i64) {
        let Some(guild) = self.fetch_guild(guild_id).await else {
            return;
        };
        self.resync_lists_for_member(&guild, user_id);
    }

    // ── Presence propagation ──────────────────────────────────────────

    /// Push the account's currently visible presence to every guild the
    /// user belongs to and refresh affected member lists.
    pub async fn broadcast_presence(&self, user_id: i64) {
        let guilds = match self.data.get_users_guilds(user_id).await {
            Ok(guilds) => guilds,
            Err(err) => {
                tracing::warn!(user_id, %err, "presence broadcast: data layer failed");
                return;
            }
        };
        let presence = self.registry.visible_presence(user_id);
        for guild in guilds {
            let payload: EventPayload = presence_payload(&presence, Some(guild.id)).into();
            for member in &guild.members {
                self.to_user(member.user.id, EVENT_PRESENCE_UPDATE, &payload);
            }
            self.resync_lists_for_member(&guild, user_id);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Socket dropped: park the session and start the resume grace
    /// window. If no resume arrives before it elapses, the session is
    /// torn down and presence recomputed from whatever remains.
    pub fn handle_disconnect(self: &Arc<Self>, session: &Arc<Session>) {
        session.mark_closed();
        let dispatcher = self.clone();
        let session_id = session.id.clone();
        let grace = self.config.resume_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            dispatcher.terminate(&session_id).await;
        });
        session.set_termination_handle(handle.abort_handle());
        tracing::debug!(
            session_id = %session.id,
            user_id = session.user_id,
            grace_ms = grace.as_millis() as u64,
            "session parked awaiting resume"
        );
    }

    /// Remove a session from both indices, unless a resume revived it in
    /// the meantime. The user's last session going away propagates an
    /// offline presence; otherwise the most-recently-active remaining
    /// session's presence becomes the account's visible one.
    pub async fn terminate(&self, session_id: &str) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        if !session.terminable() {
            tracing::debug!(session_id, "termination cancelled by resume");
            return;
        }
        session.mark_terminated();
        self.registry.remove(session_id);
        tracing::info!(
            session_id,
            user_id = session.user_id,
            "session terminated after grace window"
        );
        if session.kind == SessionKind::Gateway {
            self.broadcast_presence(session.user_id).await;
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn fetch_guild(&self, guild_id: i64) -> Option<Guild> {
        match self.data.get_guild_by_id(guild_id).await {
            Ok(Some(guild)) => Some(guild),
            Ok(None) => {
                tracing::debug!(guild_id, "fan-out: unknown guild");
                None
            }
            Err(err) => {
                tracing::warn!(guild_id, %err, "fan-out: data layer failed");
                None
            }
        }
    }

    fn channel_permissions(&self, guild: &Guild, channel: &Channel, user_id: i64) -> Permissions {
        self.permission_cache
            .get_with((channel.id, user_id), || {
                compute_channel_permissions(guild, channel, user_id)
            })
    }

    fn subscriber_sessions(&self, guild_id: i64) -> Vec<Arc<Session>> {
        self.registry
            .all_sessions()
            .into_iter()
            .filter(|s| {
                s.kind == SessionKind::Gateway && !s.is_dead() && s.has_list_subscription(guild_id)
            })
            .collect()
    }

    fn presence_map(&self, guild: &Guild) -> HashMap<i64, Status> {
        guild
            .members
            .iter()
            .map(|m| (m.user.id, self.registry.visible_presence(m.user.id).status))
            .collect()
    }

    /// Full-range SYNC of every channel list the session subscribes to.
    fn resync_session_lists(
        &self,
        guild: &Guild,
        presences: &HashMap<i64, Status>,
        session: &Arc<Session>,
    ) {
        for (channel_id, ranges) in session.subscribed_channels(guild.id) {
            let Some(channel) = guild.channel(channel_id) else {
                continue;
            };
            let items = member_list::compute_items(guild, channel, presences);
            let ops = member_list::sync_ops(&items, &ranges);
            let payload = list_update_payload(guild, channel, &items, ops);
            session.dispatch(EVENT_GUILD_MEMBER_LIST_UPDATE, &payload.into());
            session.store_list_items(guild.id, channel_id, items);
        }
    }

    /// Minimal edits (or full SYNCs in sync-only mode) for one changed
    /// member, per subscribed session and channel.
    fn resync_lists_for_member(&self, guild: &Guild, user_id: i64) {
        let sessions = self.subscriber_sessions(guild.id);
        if sessions.is_empty() {
            return;
        }
        let presences = self.presence_map(guild);
        for session in sessions {
            for (channel_id, ranges) in session.subscribed_channels(guild.id) {
                let Some(channel) = guild.channel(channel_id) else {
                    continue;
                };
                let next = member_list::compute_items(guild, channel, &presences);
                let ops: Vec<ListOp> = if self.config.sync_only_member_lists {
                    member_list::sync_ops(&next, &ranges)
                } else {
                    match session.cached_list_items(guild.id, channel_id) {
                        Some(prev) => member_list::diff_member_update(&prev, &next, user_id),
                        None => member_list::sync_ops(&next, &ranges),
                    }
                };
                if ops.is_empty() {
                    session.store_list_items(guild.id, channel_id, next);
                    continue;
                }
                let payload = list_update_payload(guild, channel, &next, ops);
                session.dispatch(EVENT_GUILD_MEMBER_LIST_UPDATE, &payload.into());
                session.store_list_items(guild.id, channel_id, next);
            }
        }
    }
}

fn list_update_payload(
    guild: &Guild,
    channel: &Channel,
    items: &[ListItem],
    ops: Vec<ListOp>,
) -> Value {
    let summary = member_list::summarize(member_list::list_id(channel), guild.id, items);
    json!({
        "id": summary.id,
        "guild_id": guild.id.to_string(),
        "channel_id": channel.id.to_string(),
        "groups": summary.groups,
        "online_count": summary.online_count,
        "member_count": summary.member_count,
        "ops": ops,
    })
}

pub fn presence_payload(presence: &Presence, guild_id: Option<i64>) -> Value {
    let mut payload = json!({
        "user_id": presence.user_id.to_string(),
        "status": presence.status,
        "activities": presence.activities,
        "since": presence.since,
    });
    if let Some(guild_id) = guild_id {
        payload["guild_id"] = json!(guild_id.to_string());
    }
    payload
}
