use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Idle,
    Dnd,
    Invisible,
    #[default]
    Offline,
}

impl Status {
    /// Whether the member sorts into an online bucket of the member list.
    /// Invisible users are indistinguishable from offline ones to everyone
    /// else.
    pub fn counts_as_online(self) -> bool {
        matches!(self, Status::Online | Status::Idle | Status::Dnd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Idle => "idle",
            Status::Dnd => "dnd",
            Status::Invisible => "invisible",
            Status::Offline => "offline",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Status::Online),
            "idle" => Some(Status::Idle),
            "dnd" => Some(Status::Dnd),
            "invisible" => Some(Status::Invisible),
            "offline" => Some(Status::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    pub activity_type: i32,
    pub details: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: i64,
    pub status: Status,
    pub activities: Vec<Activity>,
    /// Last time the client reported going idle, if any.
    pub since: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn offline(user_id: i64) -> Self {
        Self {
            user_id,
            status: Status::Offline,
            activities: Vec::new(),
            since: None,
        }
    }

    pub fn online(user_id: i64) -> Self {
        Self {
            user_id,
            status: Status::Online,
            activities: Vec::new(),
            since: None,
        }
    }
}
