//! Demo seeding for the in-memory data layer: one guild, a hoisted role,
//! a restricted channel and a pair of accounts, so the gateway can be
//! exercised end to end without a persistence backend. Minted tokens are
//! logged at startup.

use chrono::Utc;
use halyard_data::{Account, MemoryDataLayer};
use halyard_models::channel::{Channel, ChannelType, OverwriteKind, PermissionOverwrite};
use halyard_models::guild::Guild;
use halyard_models::member::Member;
use halyard_models::permissions::Permissions;
use halyard_models::role::Role;
use halyard_models::user::User;
use halyard_util::{snowflake, token};

const TOKEN_LEN: usize = 64;

fn user(name: &str, bot: bool) -> User {
    User {
        id: snowflake::generate(0),
        username: name.to_string(),
        discriminator: "0001".to_string(),
        avatar: None,
        bot,
        flags: 0,
        created_at: Utc::now(),
    }
}

fn member(u: User, roles: Vec<i64>) -> Member {
    Member {
        user: u,
        nick: None,
        roles,
        joined_at: Utc::now(),
    }
}

fn text_channel(guild_id: i64, name: &str, position: i32) -> Channel {
    Channel {
        id: snowflake::generate(0),
        channel_type: ChannelType::Text,
        guild_id: Some(guild_id),
        name: Some(name.to_string()),
        position,
        parent_id: None,
        overwrites: Vec::new(),
        recipient_ids: Vec::new(),
    }
}

pub fn seed(data: &MemoryDataLayer) {
    let skipper = user("skipper", false);
    let bosun = user("bosun", false);
    let lookout = user("lookout", true);

    let guild_id = snowflake::generate(0);
    let crew_role_id = snowflake::generate(0);

    let deck = text_channel(guild_id, "deck", 0);
    let mut wardroom = text_channel(guild_id, "wardroom", 1);
    wardroom.overwrites = vec![
        PermissionOverwrite {
            id: guild_id,
            kind: OverwriteKind::Role,
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
        },
        PermissionOverwrite {
            id: crew_role_id,
            kind: OverwriteKind::Role,
            allow: Permissions::VIEW_CHANNEL,
            deny: Permissions::empty(),
        },
    ];

    let guild = Guild {
        id: guild_id,
        name: "Foredeck".to_string(),
        owner_id: skipper.id,
        members: vec![
            member(skipper.clone(), vec![]),
            member(bosun.clone(), vec![crew_role_id]),
            member(lookout.clone(), vec![]),
        ],
        roles: vec![
            Role {
                id: guild_id,
                guild_id,
                name: "@everyone".to_string(),
                color: 0,
                hoist: false,
                position: 0,
                permissions: Permissions::default(),
                mentionable: false,
            },
            Role {
                id: crew_role_id,
                guild_id,
                name: "crew".to_string(),
                color: 0x2f81f7,
                hoist: true,
                position: 1,
                permissions: Permissions::default() | Permissions::KICK_MEMBERS,
                mentionable: true,
            },
        ],
        channels: vec![deck, wardroom],
    };
    data.insert_guild(guild);

    data.insert_private_channel(Channel {
        id: snowflake::generate(0),
        channel_type: ChannelType::Dm,
        guild_id: None,
        name: None,
        position: 0,
        parent_id: None,
        overwrites: Vec::new(),
        recipient_ids: vec![skipper.id, bosun.id],
    });

    for (u, bot) in [(skipper, false), (bosun, false), (lookout, true)] {
        let minted = token::generate(TOKEN_LEN);
        tracing::info!(username = %u.username, token = %minted, "demo account seeded");
        data.insert_account(&minted, Account { user: u, bot });
    }
}
