//! The boundary the gateway core consumes from the (out-of-scope) data
//! layer. Guild snapshots come back fully populated (members, roles,
//! channels) and are treated as values by the engines.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use halyard_models::guild::Guild;
use halyard_models::user::User;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryDataLayer;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(String),
}

/// An authenticated account as the token store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user: User,
    pub bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub status: String,
    pub custom_status: Option<String>,
}

/// Last acknowledged message per channel, surfaced in READY so clients
/// can restore unread markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadState {
    pub channel_id: i64,
    pub last_message_id: i64,
    pub acknowledged_at: DateTime<Utc>,
}

#[async_trait]
pub trait DataLayer: Send + Sync {
    async fn get_users_guilds(&self, user_id: i64) -> Result<Vec<Guild>, DataError>;

    async fn get_guild_by_id(&self, guild_id: i64) -> Result<Option<Guild>, DataError>;

    async fn get_account_by_token(&self, token: &str) -> Result<Option<Account>, DataError>;

    async fn get_account_by_user_id(&self, user_id: i64) -> Result<Option<Account>, DataError>;

    /// Recipient user ids of a direct/group conversation, or `None` if the
    /// channel does not exist or is not private.
    async fn get_private_channel_recipients(
        &self,
        channel_id: i64,
    ) -> Result<Option<Vec<i64>>, DataError>;

    async fn update_settings(
        &self,
        user_id: i64,
        settings: UserSettings,
    ) -> Result<(), DataError>;

    async fn get_latest_acknowledgements(
        &self,
        user_id: i64,
    ) -> Result<Vec<ReadState>, DataError>;
}
