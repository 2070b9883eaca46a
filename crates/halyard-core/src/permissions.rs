//! Effective-permission resolution over guild snapshots. Pure functions,
//! safe for concurrent invocation; nothing here touches shared state.

use std::collections::HashSet;

use halyard_models::channel::{Channel, OverwriteKind};
use halyard_models::guild::Guild;
use halyard_models::permissions::Permissions;

/// Union of the `@everyone` role and every role the member holds.
/// The guild owner always resolves to the full set, as does any member
/// whose role union carries ADMINISTRATOR. Non-members resolve to empty.
pub fn compute_guild_permissions(guild: &Guild, user_id: i64) -> Permissions {
    if user_id == guild.owner_id {
        return Permissions::all();
    }
    let Some(member) = guild.member(user_id) else {
        return Permissions::empty();
    };

    let mut perms = guild
        .everyone_role()
        .map(|r| r.permissions)
        .unwrap_or_else(Permissions::empty);
    for role_id in &member.roles {
        if let Some(role) = guild.role(*role_id) {
            perms |= role.permissions;
        }
    }

    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    perms
}

/// Channel-level resolution: base union, then overwrites in precedence
/// order everyone < role < member, independent of overwrite array order.
/// ADMINISTRATOR cannot be revoked by a deny overwrite.
pub fn compute_channel_permissions(
    guild: &Guild,
    channel: &Channel,
    user_id: i64,
) -> Permissions {
    if user_id == guild.owner_id {
        return Permissions::all();
    }
    let base = compute_guild_permissions(guild, user_id);
    if base.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    if channel.overwrites.is_empty() {
        return base;
    }

    let mut perms = base;

    // The @everyone overwrite carries the guild's own id.
    if let Some(everyone) = channel
        .overwrites
        .iter()
        .find(|o| o.kind == OverwriteKind::Role && o.id == guild.id)
    {
        perms &= !everyone.deny;
        perms |= everyone.allow;
    }

    let member_roles: HashSet<i64> = guild
        .member(user_id)
        .map(|m| m.roles.iter().copied().collect())
        .unwrap_or_default();
    let mut role_allow = Permissions::empty();
    let mut role_deny = Permissions::empty();
    for overwrite in channel.overwrites.iter().filter(|o| {
        o.kind == OverwriteKind::Role && o.id != guild.id && member_roles.contains(&o.id)
    }) {
        role_deny |= overwrite.deny;
        role_allow |= overwrite.allow;
    }
    perms &= !role_deny;
    perms |= role_allow;

    if let Some(member_ow) = channel
        .overwrites
        .iter()
        .find(|o| o.kind == OverwriteKind::Member && o.id == user_id)
    {
        perms &= !member_ow.deny;
        perms |= member_ow.allow;
    }

    // An allow overwrite can grant ADMINISTRATOR; once present it implies
    // everything.
    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    perms
}

pub fn has_guild_permission(guild: &Guild, user_id: i64, required: Permissions) -> bool {
    compute_guild_permissions(guild, user_id).contains(required)
}

pub fn has_channel_permission(
    guild: &Guild,
    channel: &Channel,
    user_id: i64,
    required: Permissions,
) -> bool {
    compute_channel_permissions(guild, channel, user_id).contains(required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use halyard_models::channel::{ChannelType, PermissionOverwrite};
    use halyard_models::member::Member;
    use halyard_models::role::Role;
    use halyard_models::user::User;

    fn user(id: i64) -> User {
        User {
            id,
            username: format!("user{id}"),
            discriminator: "0001".to_string(),
            avatar: None,
            bot: false,
            flags: 0,
            created_at: Utc::now(),
        }
    }

    fn member(id: i64, roles: Vec<i64>) -> Member {
        Member {
            user: user(id),
            nick: None,
            roles,
            joined_at: Utc::now(),
        }
    }

    fn role(id: i64, guild_id: i64, permissions: Permissions) -> Role {
        Role {
            id,
            guild_id,
            name: format!("role{id}"),
            color: 0,
            hoist: false,
            position: 0,
            permissions,
            mentionable: false,
        }
    }

    fn channel(id: i64, guild_id: i64, overwrites: Vec<PermissionOverwrite>) -> Channel {
        Channel {
            id,
            channel_type: ChannelType::Text,
            guild_id: Some(guild_id),
            name: Some(format!("channel{id}")),
            position: 0,
            parent_id: None,
            overwrites,
            recipient_ids: Vec::new(),
        }
    }

    fn guild() -> Guild {
        Guild {
            id: 100,
            name: "guild".to_string(),
            owner_id: 1,
            members: vec![member(1, vec![]), member(2, vec![200]), member(3, vec![])],
            roles: vec![
                role(100, 100, Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES),
                role(200, 100, Permissions::BAN_MEMBERS),
            ],
            channels: Vec::new(),
        }
    }

    #[test]
    fn test_owner_has_all_permissions() {
        let g = guild();
        assert_eq!(compute_guild_permissions(&g, 1), Permissions::all());
        let c = channel(
            10,
            100,
            vec![PermissionOverwrite {
                id: 100,
                kind: OverwriteKind::Role,
                allow: Permissions::empty(),
                deny: Permissions::all(),
            }],
        );
        assert_eq!(compute_channel_permissions(&g, &c, 1), Permissions::all());
    }

    #[test]
    fn test_role_union() {
        let g = guild();
        let perms = compute_guild_permissions(&g, 2);
        assert!(perms.contains(Permissions::VIEW_CHANNEL));
        assert!(perms.contains(Permissions::BAN_MEMBERS));
        assert!(!perms.contains(Permissions::KICK_MEMBERS));
    }

    #[test]
    fn test_non_member_has_nothing() {
        let g = guild();
        assert_eq!(compute_guild_permissions(&g, 99), Permissions::empty());
    }

    #[test]
    fn test_administrator_survives_deny_overwrites() {
        let mut g = guild();
        g.roles.push(role(300, 100, Permissions::ADMINISTRATOR));
        g.members.push(member(4, vec![300]));
        let c = channel(
            10,
            100,
            vec![
                PermissionOverwrite {
                    id: 100,
                    kind: OverwriteKind::Role,
                    allow: Permissions::empty(),
                    deny: Permissions::VIEW_CHANNEL,
                },
                PermissionOverwrite {
                    id: 4,
                    kind: OverwriteKind::Member,
                    allow: Permissions::empty(),
                    deny: Permissions::VIEW_CHANNEL,
                },
            ],
        );
        assert_eq!(compute_channel_permissions(&g, &c, 4), Permissions::all());
    }

    #[test]
    fn test_overwrite_precedence_member_wins_last() {
        // everyone-deny, role-allow, member-deny on the same bit: the
        // member overwrite decides, regardless of array order.
        let g = guild();
        let c = channel(
            10,
            100,
            vec![
                PermissionOverwrite {
                    id: 2,
                    kind: OverwriteKind::Member,
                    allow: Permissions::empty(),
                    deny: Permissions::VIEW_CHANNEL,
                },
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
            ],
        );
        assert!(!compute_channel_permissions(&g, &c, 2).contains(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn test_role_allow_overrides_everyone_deny() {
        let g = guild();
        let c = channel(
            10,
            100,
            vec![
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
            ],
        );
        // user 2 holds role 200
        assert!(compute_channel_permissions(&g, &c, 2).contains(Permissions::VIEW_CHANNEL));
        // user 3 holds only @everyone
        assert!(!compute_channel_permissions(&g, &c, 3).contains(Permissions::VIEW_CHANNEL));
    }

    #[test]
    fn test_no_overwrites_passes_base_through() {
        let g = guild();
        let c = channel(10, 100, vec![]);
        assert_eq!(
            compute_channel_permissions(&g, &c, 2),
            compute_guild_permissions(&g, 2)
        );
    }
}
