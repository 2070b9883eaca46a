//! Lazy member-list engine: computes the grouped, presence-sorted,
//! paginated member sidebar for a channel and produces either full
//! range SYNCs or minimal incremental edits against a previously
//! emitted item array.
//!
//! The item-array order is a pure function of (membership, roles,
//! presences); recomputing with unchanged inputs yields an identical
//! array, which is what keeps index-based edits from desynchronizing
//! the client's cached view.

use std::collections::{HashMap, HashSet};

use halyard_models::channel::Channel;
use halyard_models::guild::Guild;
use halyard_models::permissions::Permissions;
use halyard_models::presence::Status;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::permissions::has_channel_permission;

/// Shared sentinel for channels whose read access is unrestricted: they
/// all present the same list and collapse onto one id.
pub const LIST_ID_EVERYONE: &str = "everyone";

/// A section header id: a hoisted role, or one of the two synthetic
/// catch-all buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    Role(i64),
    Online,
    Offline,
}

impl Serialize for GroupId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GroupId::Role(id) => serializer.serialize_str(&id.to_string()),
            GroupId::Online => serializer.serialize_str("online"),
            GroupId::Offline => serializer.serialize_str("offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListGroup {
    pub id: GroupId,
    pub count: usize,
}

/// A member item as it appears in the sidebar, with presence baked in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListMember {
    pub user_id: i64,
    pub username: String,
    pub roles: Vec<i64>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListItem {
    Group(ListGroup),
    Member(ListMember),
}

impl ListItem {
    fn member_id(&self) -> Option<i64> {
        match self {
            ListItem::Member(m) => Some(m.user_id),
            ListItem::Group(_) => None,
        }
    }

    fn group_id(&self) -> Option<GroupId> {
        match self {
            ListItem::Group(g) => Some(g.id),
            ListItem::Member(_) => None,
        }
    }
}

/// One edit against the client's cached item array. SYNC replaces an
/// index range wholesale; the others are positional single-item edits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum ListOp {
    Sync {
        range: (u64, u64),
        items: Vec<ListItem>,
    },
    Update {
        index: usize,
        item: ListItem,
    },
    Insert {
        index: usize,
        item: ListItem,
    },
    Delete {
        index: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberList {
    pub id: String,
    pub guild_id: i64,
    pub groups: Vec<ListGroup>,
    pub member_count: usize,
    pub online_count: usize,
}

/// Content-addressed list identity: channels with identical
/// read-visibility shape share one externally visible list id.
pub fn list_id(channel: &Channel) -> String {
    let mut tokens: Vec<String> = Vec::new();
    for overwrite in &channel.overwrites {
        if overwrite.allow.contains(Permissions::VIEW_CHANNEL) {
            tokens.push(format!("allow:{}", overwrite.id));
        }
        if overwrite.deny.contains(Permissions::VIEW_CHANNEL) {
            tokens.push(format!("deny:{}", overwrite.id));
        }
    }
    if tokens.is_empty() {
        return LIST_ID_EVERYONE.to_string();
    }
    tokens.sort();
    let digest = Sha256::digest(tokens.join(",").as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The flattened, totally ordered item array for one channel.
///
/// Grouping: hoisted roles by descending position (online holders only),
/// then the `online` catch-all, then `offline`. Within a group, members
/// sort by display name, case-insensitive, user id as tiebreak. Members
/// in the offline bucket have their status forced to offline regardless
/// of tracked state.
pub fn compute_items(
    guild: &Guild,
    channel: &Channel,
    presences: &HashMap<i64, Status>,
) -> Vec<ListItem> {
    let mut visible: Vec<(&halyard_models::member::Member, Status)> = guild
        .members
        .iter()
        .filter(|m| has_channel_permission(guild, channel, m.user.id, Permissions::VIEW_CHANNEL))
        .map(|m| {
            let status = presences.get(&m.user.id).copied().unwrap_or(Status::Offline);
            (m, status)
        })
        .collect();

    visible.sort_by(|(a, sa), (b, sb)| {
        let a_online = sa.counts_as_online();
        let b_online = sb.counts_as_online();
        b_online
            .cmp(&a_online)
            .then_with(|| {
                a.display_name()
                    .to_lowercase()
                    .cmp(&b.display_name().to_lowercase())
            })
            .then_with(|| a.user.id.cmp(&b.user.id))
    });

    let mut hoisted: Vec<&halyard_models::role::Role> =
        guild.roles.iter().filter(|r| r.hoist).collect();
    hoisted.sort_by(|a, b| b.position.cmp(&a.position).then_with(|| a.id.cmp(&b.id)));

    let mut items = Vec::with_capacity(visible.len() + hoisted.len() + 2);
    let mut placed: HashSet<i64> = HashSet::new();

    for role in hoisted {
        let bucket: Vec<&(&halyard_models::member::Member, Status)> = visible
            .iter()
            .filter(|(m, s)| {
                s.counts_as_online() && m.roles.contains(&role.id) && !placed.contains(&m.user.id)
            })
            .collect();
        if bucket.is_empty() {
            continue;
        }
        items.push(ListItem::Group(ListGroup {
            id: GroupId::Role(role.id),
            count: bucket.len(),
        }));
        for (member, status) in bucket {
            placed.insert(member.user.id);
            items.push(member_item(member, *status));
        }
    }

    let online_rest: Vec<&(&halyard_models::member::Member, Status)> = visible
        .iter()
        .filter(|(m, s)| s.counts_as_online() && !placed.contains(&m.user.id))
        .collect();
    if !online_rest.is_empty() {
        items.push(ListItem::Group(ListGroup {
            id: GroupId::Online,
            count: online_rest.len(),
        }));
        for (member, status) in online_rest {
            placed.insert(member.user.id);
            items.push(member_item(member, *status));
        }
    }

    let offline: Vec<&(&halyard_models::member::Member, Status)> = visible
        .iter()
        .filter(|(m, _)| !placed.contains(&m.user.id))
        .collect();
    if !offline.is_empty() {
        items.push(ListItem::Group(ListGroup {
            id: GroupId::Offline,
            count: offline.len(),
        }));
        for (member, _) in offline {
            items.push(member_item(member, Status::Offline));
        }
    }

    items
}

fn member_item(member: &halyard_models::member::Member, status: Status) -> ListItem {
    ListItem::Member(ListMember {
        user_id: member.user.id,
        username: member.display_name().to_string(),
        roles: member.roles.clone(),
        status,
    })
}

pub fn groups_of(items: &[ListItem]) -> Vec<ListGroup> {
    items
        .iter()
        .filter_map(|i| match i {
            ListItem::Group(g) => Some(*g),
            ListItem::Member(_) => None,
        })
        .collect()
}

/// Every group's count except `offline`.
pub fn online_count(groups: &[ListGroup]) -> usize {
    groups
        .iter()
        .filter(|g| g.id != GroupId::Offline)
        .map(|g| g.count)
        .sum()
}

pub fn member_count(items: &[ListItem]) -> usize {
    items
        .iter()
        .filter(|i| matches!(i, ListItem::Member(_)))
        .count()
}

/// One SYNC per requested inclusive range, clamped to the item array.
pub fn sync_ops(items: &[ListItem], ranges: &[(u64, u64)]) -> Vec<ListOp> {
    ranges
        .iter()
        .map(|&(start, end)| {
            let lo = (start as usize).min(items.len());
            let hi = ((end as usize).saturating_add(1)).min(items.len());
            ListOp::Sync {
                range: (start, end),
                items: items[lo..hi].to_vec(),
            }
        })
        .collect()
}

/// Summary header for a list-update dispatch.
pub fn summarize(list_id: String, guild_id: i64, items: &[ListItem]) -> MemberList {
    let groups = groups_of(items);
    MemberList {
        id: list_id,
        guild_id,
        online_count: online_count(&groups),
        member_count: member_count(items),
        groups,
    }
}

/// Minimal edit operations transforming `prev` into `next` for a single
/// changed member, located by user id.
///
/// The emitted index coordinates follow sequential application: deletes
/// are in `prev` coordinates (member first, then its emptied header),
/// inserts in `next` coordinates (header first if newly present, then
/// the member item).
pub fn diff_member_update(prev: &[ListItem], next: &[ListItem], user_id: i64) -> Vec<ListOp> {
    let old_index = prev.iter().position(|i| i.member_id() == Some(user_id));
    let new_index = next.iter().position(|i| i.member_id() == Some(user_id));

    let mut ops = match (old_index, new_index) {
        (Some(old), Some(new)) if old == new => vec![ListOp::Update {
            index: old,
            item: next[new].clone(),
        }],
        (Some(old), None) => removal_ops(prev, old),
        (None, Some(new)) => insertion_ops(prev, next, new),
        (Some(old), Some(new)) => {
            let mut ops = removal_ops(prev, old);
            ops.extend(insertion_ops(prev, next, new));
            ops
        }
        (None, None) => Vec::new(),
    };
    ops.extend(header_refresh_ops(prev, next));
    ops
}

/// Headers surviving from `prev` whose counts changed get an UPDATE at
/// their position in `next`, so an index-applied `prev` converges on
/// `next` exactly. Inserted and deleted headers are already handled.
fn header_refresh_ops(prev: &[ListItem], next: &[ListItem]) -> Vec<ListOp> {
    let prev_counts: HashMap<GroupId, usize> = prev
        .iter()
        .filter_map(|i| match i {
            ListItem::Group(g) => Some((g.id, g.count)),
            ListItem::Member(_) => None,
        })
        .collect();
    next.iter()
        .enumerate()
        .filter_map(|(index, item)| match item {
            ListItem::Group(g) => match prev_counts.get(&g.id) {
                Some(&count) if count != g.count => Some(ListOp::Update {
                    index,
                    item: item.clone(),
                }),
                _ => None,
            },
            ListItem::Member(_) => None,
        })
        .collect()
}

fn removal_ops(prev: &[ListItem], old_index: usize) -> Vec<ListOp> {
    let mut ops = vec![ListOp::Delete { index: old_index }];
    // Collapse the header too if the member was its group's last entry.
    if old_index > 0 {
        if let ListItem::Group(group) = &prev[old_index - 1] {
            if group.count == 1 {
                ops.push(ListOp::Delete {
                    index: old_index - 1,
                });
            }
        }
    }
    ops
}

fn insertion_ops(prev: &[ListItem], next: &[ListItem], new_index: usize) -> Vec<ListOp> {
    let mut ops = Vec::with_capacity(2);
    // Nearest header at or above the insertion point governs the member.
    let header_index = next[..new_index]
        .iter()
        .rposition(|i| matches!(i, ListItem::Group(_)));
    if let Some(header_index) = header_index {
        let header_id = next[header_index].group_id();
        let existed = prev.iter().any(|i| i.group_id() == header_id);
        if !existed {
            ops.push(ListOp::Insert {
                index: header_index,
                item: next[header_index].clone(),
            });
        }
    }
    ops.push(ListOp::Insert {
        index: new_index,
        item: next[new_index].clone(),
    });
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use halyard_models::channel::{ChannelType, OverwriteKind, PermissionOverwrite};
    use halyard_models::member::Member;
    use halyard_models::role::Role;
    use halyard_models::user::User;

    fn user(id: i64, name: &str) -> User {
        User {
            id,
            username: name.to_string(),
            discriminator: "0001".to_string(),
            avatar: None,
            bot: false,
            flags: 0,
            created_at: Utc::now(),
        }
    }

    fn member(id: i64, name: &str, roles: Vec<i64>) -> Member {
        Member {
            user: user(id, name),
            nick: None,
            roles,
            joined_at: Utc::now(),
        }
    }

    fn role(id: i64, position: i32, hoist: bool) -> Role {
        Role {
            id,
            guild_id: 100,
            name: format!("role{id}"),
            color: 0,
            hoist,
            position,
            permissions: Permissions::default(),
            mentionable: false,
        }
    }

    fn everyone_role() -> Role {
        Role {
            id: 100,
            guild_id: 100,
            name: "@everyone".to_string(),
            color: 0,
            hoist: false,
            position: 0,
            permissions: Permissions::VIEW_CHANNEL,
            mentionable: false,
        }
    }

    fn channel(overwrites: Vec<PermissionOverwrite>) -> Channel {
        Channel {
            id: 10,
            channel_type: ChannelType::Text,
            guild_id: Some(100),
            name: Some("general".to_string()),
            position: 0,
            parent_id: None,
            overwrites,
            recipient_ids: Vec::new(),
        }
    }

    fn guild(members: Vec<Member>, mut roles: Vec<Role>) -> Guild {
        roles.insert(0, everyone_role());
        Guild {
            id: 100,
            name: "guild".to_string(),
            owner_id: 999,
            members,
            roles,
            channels: Vec::new(),
        }
    }

    fn presences(entries: &[(i64, Status)]) -> HashMap<i64, Status> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_hoisted_grouping_and_order() {
        // U holds hoisted role R at position 1, V has no roles, both online.
        let g = guild(
            vec![member(1, "ursula", vec![200]), member(2, "viv", vec![])],
            vec![role(200, 1, true)],
        );
        let items = compute_items(&g, &channel(vec![]), &presences(&[(1, Status::Online), (2, Status::Online)]));

        let groups = groups_of(&items);
        assert_eq!(
            groups,
            vec![
                ListGroup {
                    id: GroupId::Role(200),
                    count: 1
                },
                ListGroup {
                    id: GroupId::Online,
                    count: 1
                },
            ]
        );
        // U listed before V
        let member_ids: Vec<i64> = items.iter().filter_map(|i| i.member_id()).collect();
        assert_eq!(member_ids, vec![1, 2]);
        assert_eq!(online_count(&groups), 2);
    }

    #[test]
    fn test_compute_items_is_deterministic() {
        let g = guild(
            vec![
                member(1, "carol", vec![200]),
                member(2, "alice", vec![]),
                member(3, "bob", vec![200]),
                member(4, "dave", vec![]),
            ],
            vec![role(200, 2, true), role(300, 1, true)],
        );
        let p = presences(&[
            (1, Status::Online),
            (2, Status::Idle),
            (3, Status::Dnd),
            (4, Status::Offline),
        ]);
        let a = compute_items(&g, &channel(vec![]), &p);
        let b = compute_items(&g, &channel(vec![]), &p);
        assert_eq!(a, b);
    }

    #[test]
    fn test_offline_bucket_forces_offline_status() {
        // Invisible members land in the offline bucket with status offline.
        let g = guild(vec![member(1, "ann", vec![])], vec![]);
        let items = compute_items(&g, &channel(vec![]), &presences(&[(1, Status::Invisible)]));
        assert_eq!(
            items,
            vec![
                ListItem::Group(ListGroup {
                    id: GroupId::Offline,
                    count: 1
                }),
                ListItem::Member(ListMember {
                    user_id: 1,
                    username: "ann".to_string(),
                    roles: vec![],
                    status: Status::Offline,
                }),
            ]
        );
    }

    #[test]
    fn test_hidden_members_are_excluded() {
        let deny_everyone = PermissionOverwrite {
            id: 100,
            kind: OverwriteKind::Role,
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
        };
        let allow_role = PermissionOverwrite {
            id: 200,
            kind: OverwriteKind::Role,
            allow: Permissions::VIEW_CHANNEL,
            deny: Permissions::empty(),
        };
        let g = guild(
            vec![member(1, "mod", vec![200]), member(2, "pleb", vec![])],
            vec![role(200, 1, false)],
        );
        let items = compute_items(
            &g,
            &channel(vec![deny_everyone, allow_role]),
            &presences(&[(1, Status::Online), (2, Status::Online)]),
        );
        let member_ids: Vec<i64> = items.iter().filter_map(|i| i.member_id()).collect();
        assert_eq!(member_ids, vec![1]);
    }

    #[test]
    fn test_list_id_sharing() {
        let overwrites = vec![
            PermissionOverwrite {
                id: 100,
                kind: OverwriteKind::Role,
                allow: Permissions::empty(),
                deny: Permissions::VIEW_CHANNEL,
            },
            PermissionOverwrite {
                id: 200,
                kind: OverwriteKind::Role,
                allow: Permissions::VIEW_CHANNEL,
                deny: Permissions::empty(),
            },
        ];
        let a = channel(overwrites.clone());
        let mut b = channel(overwrites);
        b.id = 11;
        assert_eq!(list_id(&a), list_id(&b));

        // Overwrite order does not affect identity.
        let mut c = channel(vec![]);
        c.overwrites = a.overwrites.iter().rev().cloned().collect();
        assert_eq!(list_id(&a), list_id(&c));

        // Changing the visibility shape changes the id.
        let mut d = channel(a.overwrites.clone());
        d.overwrites[0].deny = Permissions::empty();
        assert_ne!(list_id(&a), list_id(&d));

        // Overwrites not touching read access don't restrict the list.
        let mut e = channel(vec![PermissionOverwrite {
            id: 300,
            kind: OverwriteKind::Role,
            allow: Permissions::SEND_MESSAGES,
            deny: Permissions::empty(),
        }]);
        e.id = 12;
        assert_eq!(list_id(&e), LIST_ID_EVERYONE);
        assert_eq!(list_id(&channel(vec![])), LIST_ID_EVERYONE);
    }

    #[test]
    fn test_sync_ops_clamp_ranges() {
        let g = guild(
            vec![member(1, "a", vec![]), member(2, "b", vec![])],
            vec![],
        );
        let items = compute_items(
            &g,
            &channel(vec![]),
            &presences(&[(1, Status::Online), (2, Status::Online)]),
        );
        // 3 items total: online header + 2 members
        let ops = sync_ops(&items, &[(0, 99), (50, 99)]);
        match &ops[0] {
            ListOp::Sync { range, items } => {
                assert_eq!(*range, (0, 99));
                assert_eq!(items.len(), 3);
            }
            other => panic!("expected sync, got {other:?}"),
        }
        match &ops[1] {
            ListOp::Sync { items, .. } => assert!(items.is_empty()),
            other => panic!("expected sync, got {other:?}"),
        }
    }

    /// Apply positional ops the way a client would, for diff validation.
    fn apply_ops(prev: &[ListItem], ops: &[ListOp]) -> Vec<ListItem> {
        let mut out = prev.to_vec();
        for op in ops {
            match op {
                ListOp::Update { index, item } => out[*index] = item.clone(),
                ListOp::Insert { index, item } => out.insert(*index, item.clone()),
                ListOp::Delete { index } => {
                    out.remove(*index);
                }
                ListOp::Sync { .. } => panic!("diff should not emit sync"),
            }
        }
        out
    }

    #[test]
    fn test_diff_update_in_place() {
        // idle -> dnd keeps the index: single UPDATE.
        let g = guild(
            vec![member(1, "a", vec![]), member(2, "b", vec![])],
            vec![],
        );
        let c = channel(vec![]);
        let prev = compute_items(&g, &c, &presences(&[(1, Status::Idle), (2, Status::Online)]));
        let next = compute_items(&g, &c, &presences(&[(1, Status::Dnd), (2, Status::Online)]));
        let ops = diff_member_update(&prev, &next, 1);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], ListOp::Update { index: 1, .. }));
        assert_eq!(apply_ops(&prev, &ops), next);
    }

    #[test]
    fn test_diff_offline_to_online_with_hoisted_role() {
        // U offline with hoisted role R; V online with none. U comes online:
        // the offline header collapses and a new role header appears.
        let g = guild(
            vec![member(1, "ursula", vec![200]), member(2, "viv", vec![])],
            vec![role(200, 1, true)],
        );
        let c = channel(vec![]);
        let prev = compute_items(
            &g,
            &c,
            &presences(&[(1, Status::Offline), (2, Status::Online)]),
        );
        let next = compute_items(
            &g,
            &c,
            &presences(&[(1, Status::Online), (2, Status::Online)]),
        );
        let ops = diff_member_update(&prev, &next, 1);
        // delete member, delete emptied offline header, insert role
        // header, insert member
        assert_eq!(
            ops,
            vec![
                ListOp::Delete { index: 3 },
                ListOp::Delete { index: 2 },
                ListOp::Insert {
                    index: 0,
                    item: next[0].clone()
                },
                ListOp::Insert {
                    index: 1,
                    item: next[1].clone()
                },
            ]
        );
        assert_eq!(apply_ops(&prev, &ops), next);
    }

    #[test]
    fn test_diff_member_removed_collapses_header() {
        let g_before = guild(
            vec![member(1, "a", vec![]), member(2, "b", vec![])],
            vec![],
        );
        let mut g_after = g_before.clone();
        g_after.members.retain(|m| m.user.id != 2);
        let c = channel(vec![]);
        let p = presences(&[(1, Status::Online), (2, Status::Offline)]);
        let prev = compute_items(&g_before, &c, &p);
        let next = compute_items(&g_after, &c, &p);
        let ops = diff_member_update(&prev, &next, 2);
        assert_eq!(
            ops,
            vec![ListOp::Delete { index: 3 }, ListOp::Delete { index: 2 }]
        );
        assert_eq!(apply_ops(&prev, &ops), next);
    }

    #[test]
    fn test_diff_member_added_to_existing_group() {
        let mut g = guild(vec![member(1, "a", vec![])], vec![]);
        let c = channel(vec![]);
        let p = presences(&[(1, Status::Online), (2, Status::Online)]);
        let prev = compute_items(&g, &c, &p);
        g.members.push(member(2, "b", vec![]));
        let next = compute_items(&g, &c, &p);
        let ops = diff_member_update(&prev, &next, 2);
        // online header already exists: the member item is inserted and
        // the header count refreshed in place
        assert_eq!(
            ops,
            vec![
                ListOp::Insert {
                    index: 2,
                    item: next[2].clone()
                },
                ListOp::Update {
                    index: 0,
                    item: next[0].clone()
                },
            ]
        );
        assert_eq!(apply_ops(&prev, &ops), next);
    }

    #[test]
    fn test_diff_absent_member_is_noop() {
        let g = guild(vec![member(1, "a", vec![])], vec![]);
        let c = channel(vec![]);
        let p = presences(&[(1, Status::Online)]);
        let items = compute_items(&g, &c, &p);
        assert!(diff_member_update(&items, &items, 42).is_empty());
    }
}
