//! Inbound room-message webhook payload.

use serde::Deserialize;

/// HipChat `room_message` webhook body. Only the room id and the message text are required;
/// every other field the platform sends is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomMessageEvent {
    #[serde(default)]
    pub event: Option<String>,
    pub item: RoomMessageItem,
    #[serde(default)]
    pub webhook_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomMessageItem {
    pub room: EventRoom,
    pub message: EventMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRoom {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub message: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// The part of a webhook the relay acts on: where it came from and what was said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub room_id: i64,
    pub text: String,
}

impl InboundEvent {
    /// Parse a webhook body. Fails when the JSON is invalid or lacks `item.room.id` / `item.message.message`.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        let event: RoomMessageEvent = serde_json::from_slice(body)?;
        Ok(event.into())
    }
}

impl From<RoomMessageEvent> for InboundEvent {
    fn from(event: RoomMessageEvent) -> Self {
        Self {
            room_id: event.item.room.id,
            text: event.item.message.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_event() {
        let ev = InboundEvent::from_json(
            br#"{"item":{"room":{"id":42},"message":{"message":"cats"}}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            InboundEvent {
                room_id: 42,
                text: "cats".to_string()
            }
        );
    }

    #[test]
    fn ignores_extra_fields() {
        let body = br#"{
            "event": "room_message",
            "item": {
                "message": {
                    "date": "2015-01-20T22:45:06.662545+00:00",
                    "from": {"id": 1661743, "mention_name": "Blinky", "name": "Blinky the Three Eyed Fish"},
                    "id": "00a3eb7f-fac5-496a-8d64-a9050c712ca1",
                    "mentions": [],
                    "message": "/adblock dogs",
                    "type": "message"
                },
                "room": {"id": 1147567, "name": "The Weather Channel"}
            },
            "oauth_client_id": "abc",
            "webhook_id": 578829
        }"#;
        let raw: RoomMessageEvent = serde_json::from_slice(body).unwrap();
        assert_eq!(raw.event.as_deref(), Some("room_message"));
        assert_eq!(raw.item.room.name.as_deref(), Some("The Weather Channel"));
        let ev = InboundEvent::from(raw);
        assert_eq!(ev.room_id, 1147567);
        assert_eq!(ev.text, "/adblock dogs");
    }

    #[test]
    fn missing_room_id_fails() {
        assert!(InboundEvent::from_json(br#"{"item":{"room":{},"message":{"message":"x"}}}"#).is_err());
    }

    #[test]
    fn missing_message_text_fails() {
        assert!(InboundEvent::from_json(br#"{"item":{"room":{"id":1},"message":{}}}"#).is_err());
    }

    #[test]
    fn room_id_must_be_integer() {
        assert!(InboundEvent::from_json(br#"{"item":{"room":{"id":"1"},"message":{"message":"x"}}}"#).is_err());
    }

    #[test]
    fn not_json_fails() {
        assert!(InboundEvent::from_json(b"room=1&message=x").is_err());
    }
}
