//! Maps outbound event types to the capability bit a session must hold
//! to receive them, and applies message-content redaction for sessions
//! lacking the content bit.

use halyard_models::gateway::*;
use halyard_models::intents::Intents;
use serde_json::{json, Value};

/// The capability bit required to receive an event, or `None` when the
/// event is delivered unconditionally (READY, RESUMED, chunk and list
/// responses the session explicitly asked for).
///
/// A few "complex" types are scoped by payload: a guild identifier
/// selects the guild-scoped bit, its absence the direct-message one.
pub fn required_intent(event_type: &str, payload: &Value) -> Option<Intents> {
    let guild_scoped = payload
        .get("guild_id")
        .map(|v| !v.is_null())
        .unwrap_or(false);

    match event_type {
        EVENT_GUILD_CREATE
        | EVENT_GUILD_UPDATE
        | EVENT_GUILD_DELETE
        | EVENT_GUILD_ROLE_CREATE
        | EVENT_GUILD_ROLE_UPDATE
        | EVENT_GUILD_ROLE_DELETE
        | EVENT_CHANNEL_CREATE
        | EVENT_CHANNEL_UPDATE
        | EVENT_CHANNEL_DELETE => Some(Intents::GUILDS),
        EVENT_GUILD_MEMBER_ADD | EVENT_GUILD_MEMBER_REMOVE | EVENT_GUILD_MEMBER_UPDATE => {
            Some(Intents::GUILD_MEMBERS)
        }
        EVENT_GUILD_BAN_ADD | EVENT_GUILD_BAN_REMOVE => Some(Intents::GUILD_BANS),
        EVENT_GUILD_EMOJIS_UPDATE => Some(Intents::GUILD_EMOJIS),
        EVENT_VOICE_STATE_UPDATE => Some(Intents::GUILD_VOICE_STATES),
        EVENT_PRESENCE_UPDATE => Some(Intents::GUILD_PRESENCES),
        EVENT_MESSAGE_CREATE | EVENT_MESSAGE_UPDATE | EVENT_MESSAGE_DELETE => {
            Some(if guild_scoped {
                Intents::GUILD_MESSAGES
            } else {
                Intents::DIRECT_MESSAGES
            })
        }
        EVENT_MESSAGE_REACTION_ADD | EVENT_MESSAGE_REACTION_REMOVE => Some(if guild_scoped {
            Intents::GUILD_MESSAGE_REACTIONS
        } else {
            Intents::DIRECT_MESSAGE_REACTIONS
        }),
        EVENT_TYPING_START => Some(if guild_scoped {
            Intents::GUILD_MESSAGE_TYPING
        } else {
            Intents::DIRECT_MESSAGE_TYPING
        }),
        EVENT_CHANNEL_PINS_UPDATE => Some(if guild_scoped {
            Intents::GUILDS
        } else {
            Intents::DIRECT_MESSAGES
        }),
        _ => None,
    }
}

/// Whether the payload of this event must have its message body cleared
/// before delivery to a session with the given bitmask. The event still
/// fires so clients can cache metadata; it just carries no text.
pub fn requires_content_redaction(event_type: &str, intents: Intents) -> bool {
    matches!(event_type, EVENT_MESSAGE_CREATE | EVENT_MESSAGE_UPDATE)
        && !intents.contains(Intents::MESSAGE_CONTENT)
}

pub fn redact_message_content(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("content".to_string(), json!(""));
        obj.insert("embeds".to_string(), json!([]));
        obj.insert("attachments".to_string(), json!([]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_table_lookup() {
        assert_eq!(
            required_intent(EVENT_GUILD_ROLE_CREATE, &json!({})),
            Some(Intents::GUILDS)
        );
        assert_eq!(
            required_intent(EVENT_PRESENCE_UPDATE, &json!({"guild_id": "1"})),
            Some(Intents::GUILD_PRESENCES)
        );
    }

    #[test]
    fn test_complex_types_scope_by_guild_id() {
        let guild_msg = json!({"guild_id": "1", "content": "hi"});
        let dm_msg = json!({"channel_id": "2", "content": "hi"});
        assert_eq!(
            required_intent(EVENT_MESSAGE_CREATE, &guild_msg),
            Some(Intents::GUILD_MESSAGES)
        );
        assert_eq!(
            required_intent(EVENT_MESSAGE_CREATE, &dm_msg),
            Some(Intents::DIRECT_MESSAGES)
        );
        // explicit null guild_id counts as absent
        let null_guild = json!({"guild_id": null});
        assert_eq!(
            required_intent(EVENT_TYPING_START, &null_guild),
            Some(Intents::DIRECT_MESSAGE_TYPING)
        );
    }

    #[test]
    fn test_unlisted_events_are_ungated() {
        assert_eq!(required_intent(EVENT_READY, &json!({})), None);
        assert_eq!(required_intent(EVENT_RESUMED, &json!({})), None);
        assert_eq!(
            required_intent(EVENT_GUILD_MEMBER_LIST_UPDATE, &json!({})),
            None
        );
    }

    #[test]
    fn test_redaction_clears_body_fields() {
        let mut payload = json!({
            "id": "5",
            "content": "secret",
            "embeds": [{"title": "t"}],
            "attachments": [{"id": "9"}],
        });
        assert!(requires_content_redaction(
            EVENT_MESSAGE_CREATE,
            Intents::default_for_bot()
        ));
        redact_message_content(&mut payload);
        assert_eq!(payload["content"], "");
        assert_eq!(payload["embeds"], json!([]));
        assert_eq!(payload["attachments"], json!([]));
        assert_eq!(payload["id"], "5");
    }

    #[test]
    fn test_no_redaction_with_content_bit() {
        assert!(!requires_content_redaction(
            EVENT_MESSAGE_CREATE,
            Intents::default_for_user()
        ));
        assert!(!requires_content_redaction(
            EVENT_MESSAGE_DELETE,
            Intents::default_for_bot()
        ));
    }
}
