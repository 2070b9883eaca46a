//! Client capability resolution. Capabilities are derived once at
//! identify time from the connection properties and stored on the
//! session; nothing else in the codebase inspects client versions.

use chrono::NaiveDate;
use halyard_models::presence::Status;
use serde_json::Value;

/// Builds older than this predate the `dnd` and `invisible` statuses and
/// must be shown the coarse online/offline pair instead.
const EXTENDED_PRESENCE_SINCE: &str = "2022-01-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub extended_presence: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            extended_presence: true,
        }
    }
}

impl ClientCapabilities {
    /// Resolve from the `properties` object of an IDENTIFY payload.
    /// Clients that omit a build date are assumed current.
    pub fn from_identify(data: &Value) -> Self {
        let build_date = data
            .get("properties")
            .and_then(|p| p.get("client_build_date"))
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

        let extended_presence = match build_date {
            Some(date) => {
                // Constant is well-formed; parse cannot fail.
                let cutoff = NaiveDate::parse_from_str(EXTENDED_PRESENCE_SINCE, "%Y-%m-%d")
                    .unwrap_or(NaiveDate::MIN);
                date >= cutoff
            }
            None => true,
        };

        Self { extended_presence }
    }

    /// Coarsen a status for delivery to this client: clients without
    /// extended presence see `dnd` as `online` and `invisible` as
    /// `offline`.
    pub fn coarsen_status(&self, status: Status) -> Status {
        if self.extended_presence {
            return status;
        }
        match status {
            Status::Dnd => Status::Online,
            Status::Invisible => Status::Offline,
            other => other,
        }
    }

    /// Rewrite the `status` field of an outbound presence payload in
    /// place, if coarsening applies. Routes through `coarsen_status` so
    /// the mapping lives in exactly one place.
    pub fn coarsen_presence_payload(&self, payload: &mut Value) {
        if self.extended_presence {
            return;
        }
        let Some(status) = payload
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(Status::parse)
        else {
            return;
        };
        let coarse = self.coarsen_status(status);
        if coarse == status {
            return;
        }
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "status".to_string(),
                Value::String(coarse.as_str().to_string()),
            );
        }
    }
}

/// The status other users observe: invisible surfaces as offline
/// everywhere outside the user's own sessions.
pub fn public_status(status: Status) -> Status {
    if status == Status::Invisible {
        Status::Offline
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_modern_build_keeps_extended_presence() {
        let caps = ClientCapabilities::from_identify(&json!({
            "properties": {"client_build_date": "2024-06-15"}
        }));
        assert!(caps.extended_presence);
        assert_eq!(caps.coarsen_status(Status::Dnd), Status::Dnd);
    }

    #[test]
    fn test_legacy_build_coarsens() {
        let caps = ClientCapabilities::from_identify(&json!({
            "properties": {"client_build_date": "2021-03-01"}
        }));
        assert!(!caps.extended_presence);
        assert_eq!(caps.coarsen_status(Status::Dnd), Status::Online);
        assert_eq!(caps.coarsen_status(Status::Invisible), Status::Offline);
        assert_eq!(caps.coarsen_status(Status::Idle), Status::Idle);
    }

    #[test]
    fn test_missing_properties_assumed_current() {
        let caps = ClientCapabilities::from_identify(&json!({"token": "t"}));
        assert!(caps.extended_presence);
    }

    #[test]
    fn test_payload_coarsening_rewrites_status() {
        let caps = ClientCapabilities {
            extended_presence: false,
        };
        let mut payload = json!({"user_id": "1", "status": "dnd"});
        caps.coarsen_presence_payload(&mut payload);
        assert_eq!(payload["status"], "online");
    }

    #[test]
    fn test_public_status_hides_invisible() {
        assert_eq!(public_status(Status::Invisible), Status::Offline);
        assert_eq!(public_status(Status::Dnd), Status::Dnd);
    }
}
