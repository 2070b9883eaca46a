use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::member::Member;
use crate::role::Role;

/// Read-mostly membership snapshot handed into the permission and list
/// engines. Fetched from the data layer per operation and treated as a
/// value: the engines never mutate it except on an in-hand copy.
///
/// The `@everyone` role carries the guild's own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub members: Vec<Member>,
    pub roles: Vec<Role>,
    pub channels: Vec<Channel>,
}

impl Guild {
    pub fn member(&self, user_id: i64) -> Option<&Member> {
        self.members.iter().find(|m| m.user.id == user_id)
    }

    pub fn role(&self, role_id: i64) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == role_id)
    }

    pub fn channel(&self, channel_id: i64) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    pub fn everyone_role(&self) -> Option<&Role> {
        self.role(self.id)
    }

    pub fn is_member(&self, user_id: i64) -> bool {
        self.member(user_id).is_some()
    }
}
