use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
    Both,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
            CallKind::Both => "both",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Ended,
    Timeout,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ended | SessionStatus::Timeout | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Failed => "failed",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Processing,
    Earned,
    Pending,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NotAvailable,
    Busy,
    NotInterested,
    Other,
}

/// Why a session reached a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Timeout,
    Hangup,
    Rejected,
    PaymentFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Timeout => "timeout",
            EndReason::Hangup => "hangup",
            EndReason::Rejected => "rejected",
            EndReason::PaymentFailed => "payment_failed",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub id: Uuid,
    pub name: String,
    pub kind: CallKind,
    pub duration_minutes: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_percent: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub listener_amount: Decimal,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseInfo {
    pub id: Uuid,
    pub talker_id: Uuid,
    pub listener_id: Uuid,
    pub template_id: Uuid,
    pub status: PurchaseStatus,
    pub kind: CallKind,
    pub duration_minutes: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub listener_amount: Decimal,
    pub is_extension: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub talker_id: Uuid,
    pub listener_id: Uuid,
    pub status: SessionStatus,
    pub kind: CallKind,
    pub total_minutes_purchased: i32,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub minutes_used: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

/// Join credentials for the external media transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaCredentials {
    pub app_id: String,
    pub channel: String,
    pub uid: u32,
    pub token: String,
    pub expires_in_secs: u64,
    pub kind: CallKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub purchase: PurchaseInfo,
    pub checkout_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAllocation {
    pub session: SessionInfo,
    pub attach_url: String,
    pub media: MediaCredentials,
}

/// A free listener suggested when the requested one is busy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerHint {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub lifetime_earned: Decimal,
    /// Sum of non-extension payout rows in {earned, pending}. Extension
    /// earnings are credited to `available` but excluded here.
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawable: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub extension_earned: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutInfo {
    pub id: Uuid,
    pub purchase_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: PayoutStatus,
    pub is_extension: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub earned_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn session_status_terminality() {
        assert!(!SessionStatus::Connecting.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Timeout.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn balance_serializes_amounts_as_floats() {
        let balance = BalanceInfo {
            available: dec!(18.00),
            lifetime_earned: dec!(36.00),
            withdrawable: dec!(18.00),
            extension_earned: dec!(18.00),
        };

        let json = serde_json::to_value(&balance).unwrap();
        assert_eq!(json["available"], serde_json::json!(18.0));
        assert_eq!(json["lifetime_earned"], serde_json::json!(36.0));
    }
}
