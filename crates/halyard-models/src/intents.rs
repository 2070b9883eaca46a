use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Per-session capability bitmask declaring which categories of events
    /// the client wants delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u64 {
        const GUILDS                   = 1 << 0;
        const GUILD_MEMBERS            = 1 << 1;
        const GUILD_BANS               = 1 << 2;
        const GUILD_EMOJIS             = 1 << 3;
        const GUILD_INVITES            = 1 << 6;
        const GUILD_VOICE_STATES       = 1 << 7;
        const GUILD_PRESENCES          = 1 << 8;
        const GUILD_MESSAGES           = 1 << 9;
        const GUILD_MESSAGE_REACTIONS  = 1 << 10;
        const GUILD_MESSAGE_TYPING     = 1 << 11;
        const DIRECT_MESSAGES          = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING    = 1 << 14;
        /// Gates message body visibility: without it, message payloads are
        /// delivered with content, embeds and attachments cleared.
        const MESSAGE_CONTENT          = 1 << 15;
    }
}

impl Intents {
    /// Fallback bitmask for user accounts that identify without an
    /// explicit `intents` field: everything.
    pub fn default_for_user() -> Self {
        Self::all()
    }

    /// Fallback bitmask for bot accounts: everything except the
    /// privileged presence, member and message-content categories.
    pub fn default_for_bot() -> Self {
        Self::all() - Self::GUILD_PRESENCES - Self::GUILD_MEMBERS - Self::MESSAGE_CONTENT
    }
}

impl Serialize for Intents {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(Intents::from_bits_truncate(bits))
    }
}
