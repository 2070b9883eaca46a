use serde::{Deserialize, Serialize};

use crate::permissions::Permissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum ChannelType {
    Text = 0,
    Dm = 1,
    Voice = 2,
    GroupDm = 3,
    Category = 4,
    Announcement = 5,
}

impl ChannelType {
    pub fn is_private(self) -> bool {
        matches!(self, ChannelType::Dm | ChannelType::GroupDm)
    }
}

/// A per-channel permission exception targeting one role or one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteKind {
    Role,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: i64,
    pub kind: OverwriteKind,
    pub allow: Permissions,
    pub deny: Permissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    pub guild_id: Option<i64>,
    pub name: Option<String>,
    pub position: i32,
    pub parent_id: Option<i64>,
    pub overwrites: Vec<PermissionOverwrite>,
    /// Fixed recipient set for DM / group DM channels; empty for guild channels.
    pub recipient_ids: Vec<i64>,
}
