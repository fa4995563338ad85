mod api;
mod event;
mod message;

pub use api::*;
pub use event::*;
pub use message::*;

/// WebSocket close codes used by the call attachment.
pub mod close_code {
    /// Authentication missing or invalid.
    pub const AUTH: u16 = 4001;
    /// Caller is neither talker nor listener of the session.
    pub const NOT_PARTICIPANT: u16 = 4003;
    /// Unknown session id.
    pub const NO_SUCH_SESSION: u16 = 4004;
    /// Session already reached a terminal status.
    pub const SESSION_TERMINAL: u16 = 4010;
    /// Payment for the initial purchase is not valid.
    pub const PAYMENT_INVALID: u16 = 4402;
}

/// Path of the call attachment for a given session.
pub fn call_attach_path(session_id: uuid::Uuid) -> String {
    format!("/ws/call/{session_id}")
}
