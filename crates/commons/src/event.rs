use crate::CallKind;
use crate::EndReason;
use crate::SessionStatus;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Shared fields carried by every call-group event except relays. Clients
/// reconcile their displayed countdown against `remaining_minutes` and
/// `server_time`; the server clock is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session_id: Uuid,
    pub status: SessionStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub remaining_minutes: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First frame on every successful attach.
    ConnectionEstablished {
        #[serde(flatten)]
        envelope: SessionEnvelope,
    },
    /// Full status snapshot, sent on attach and on `get_status`.
    CallStatus {
        #[serde(flatten)]
        envelope: SessionEnvelope,
        total_minutes: i32,
        timer_running: bool,
        waiting_for_accept: bool,
        #[serde(with = "time::serde::rfc3339::option")]
        started_at: Option<OffsetDateTime>,
    },
    CallAccepted {
        #[serde(flatten)]
        envelope: SessionEnvelope,
        total_minutes: i32,
        #[serde(with = "time::serde::rfc3339")]
        started_at: OffsetDateTime,
    },
    TimeWarning {
        #[serde(flatten)]
        envelope: SessionEnvelope,
    },
    TimeUpdate {
        #[serde(flatten)]
        envelope: SessionEnvelope,
    },
    MinutesExtended {
        #[serde(flatten)]
        envelope: SessionEnvelope,
        added_minutes: i32,
        new_total_minutes: i32,
        extension_purchase_id: Uuid,
    },
    CallEnding {
        #[serde(flatten)]
        envelope: SessionEnvelope,
        reason: EndReason,
    },
    CallEnded {
        #[serde(flatten)]
        envelope: SessionEnvelope,
        reason: EndReason,
        #[serde(with = "rust_decimal::serde::float")]
        minutes_used: Decimal,
        ended_by: Option<Uuid>,
    },
    Error {
        code: u16,
        message: String,
        #[serde(with = "time::serde::rfc3339")]
        server_time: OffsetDateTime,
    },
    /// Opaque blob forwarded between the two attachments of a session.
    /// Never interpreted by the server.
    SignalRelay {
        sender_id: Uuid,
        payload: serde_json::Value,
    },
    Pong,
    /// User-group frame: a confirmed purchase was allocated into a session
    /// and the listener's phone should ring.
    IncomingCall {
        session_id: Uuid,
        talker_id: Uuid,
        talker_name: String,
        kind: CallKind,
        total_minutes: i32,
        #[serde(with = "time::serde::rfc3339")]
        server_time: OffsetDateTime,
    },
    /// User-group frame for the conversation-list projection.
    ConversationListChanged {
        #[serde(with = "time::serde::rfc3339")]
        server_time: OffsetDateTime,
    },
}

impl Event {
    /// Stable name of the variant, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectionEstablished { .. } => "connection_established",
            Event::CallStatus { .. } => "call_status",
            Event::CallAccepted { .. } => "call_accepted",
            Event::TimeWarning { .. } => "time_warning",
            Event::TimeUpdate { .. } => "time_update",
            Event::MinutesExtended { .. } => "minutes_extended",
            Event::CallEnding { .. } => "call_ending",
            Event::CallEnded { .. } => "call_ended",
            Event::Error { .. } => "error",
            Event::SignalRelay { .. } => "signal_relay",
            Event::Pong => "pong",
            Event::IncomingCall { .. } => "incoming_call",
            Event::ConversationListChanged { .. } => "conversation_list_changed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn envelope() -> SessionEnvelope {
        SessionEnvelope {
            session_id: Uuid::new_v4(),
            status: SessionStatus::Active,
            remaining_minutes: dec!(12.5),
            server_time: datetime!(2026-03-02 10:45:00 UTC),
        }
    }

    #[test]
    fn call_group_events_carry_the_envelope() {
        let event = Event::MinutesExtended {
            envelope: envelope(),
            added_minutes: 10,
            new_total_minutes: 20,
            extension_purchase_id: Uuid::new_v4(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "minutes_extended");
        assert!(json["session_id"].is_string());
        assert_eq!(json["status"], "active");
        assert_eq!(json["remaining_minutes"], serde_json::json!(12.5));
        assert!(json["server_time"].is_string());
    }

    #[test]
    fn signal_relay_payload_is_passed_through_opaquely() {
        let payload = serde_json::json!({"sdp": "v=0...", "kind": "offer"});
        let event = Event::SignalRelay {
            sender_id: Uuid::new_v4(),
            payload: payload.clone(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"], payload);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn status_snapshot_before_acceptance_shows_timer_stopped() {
        let mut envelope = envelope();
        envelope.status = SessionStatus::Connecting;
        envelope.remaining_minutes = dec!(10);

        let event = Event::CallStatus {
            envelope,
            total_minutes: 10,
            timer_running: false,
            waiting_for_accept: true,
            started_at: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timer_running"], serde_json::json!(false));
        assert_eq!(json["waiting_for_accept"], serde_json::json!(true));
        assert_eq!(json["remaining_minutes"], serde_json::json!(10.0));
        assert_eq!(json["started_at"], serde_json::Value::Null);
    }
}
