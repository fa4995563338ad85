use serde::Deserialize;
use serde::Serialize;

/// Client → server frames accepted on the call attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat; answered with [`crate::Event::Pong`].
    Ping,
    /// Opaque signaling blob for the peer attachment.
    SignalRelay { payload: serde_json::Value },
    /// Ask for a fresh [`crate::Event::CallStatus`] snapshot.
    GetStatus,
    /// Hang up.
    End,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_inbound_frames() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);

        let relay: ClientMessage =
            serde_json::from_str(r#"{"type":"signal_relay","payload":{"ice":[1,2]}}"#).unwrap();
        assert!(matches!(relay, ClientMessage::SignalRelay { .. }));

        let status: ClientMessage = serde_json::from_str(r#"{"type":"get_status"}"#).unwrap();
        assert_eq!(status, ClientMessage::GetStatus);

        let end: ClientMessage = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert_eq!(end, ClientMessage::End);
    }

    #[test]
    fn unknown_frame_types_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"open_mic"}"#).is_err());
    }
}
