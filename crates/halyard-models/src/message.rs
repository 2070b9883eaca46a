use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub guild_id: Option<i64>,
    pub author_id: i64,
    pub content: String,
    pub embeds: Vec<serde_json::Value>,
    pub attachments: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
