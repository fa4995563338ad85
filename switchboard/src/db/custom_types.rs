use crate::schema::sql_types::CallKindType;
use crate::schema::sql_types::PayoutStatusType;
use crate::schema::sql_types::PurchaseStatusType;
use crate::schema::sql_types::RejectionReasonType;
use crate::schema::sql_types::SessionStatusType;
use crate::schema::sql_types::UserRoleType;
use diesel::deserialize;
use diesel::deserialize::FromSql;
use diesel::pg::Pg;
use diesel::pg::PgValue;
use diesel::query_builder::QueryId;
use diesel::serialize;
use diesel::serialize::IsNull;
use diesel::serialize::Output;
use diesel::serialize::ToSql;
use diesel::AsExpression;
use diesel::FromSqlRow;
use std::any::TypeId;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = UserRoleType)]
pub enum UserRole {
    Talker,
    Listener,
}

impl QueryId for UserRoleType {
    type QueryId = UserRoleType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<UserRoleType, Pg> for UserRole {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            UserRole::Talker => out.write_all(b"talker")?,
            UserRole::Listener => out.write_all(b"listener")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<UserRoleType, Pg> for UserRole {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"talker" => Ok(UserRole::Talker),
            b"listener" => Ok(UserRole::Listener),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = CallKindType)]
pub enum CallKind {
    Audio,
    Video,
    Both,
}

impl QueryId for CallKindType {
    type QueryId = CallKindType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<CallKindType, Pg> for CallKind {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            CallKind::Audio => out.write_all(b"audio")?,
            CallKind::Video => out.write_all(b"video")?,
            CallKind::Both => out.write_all(b"both")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<CallKindType, Pg> for CallKind {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"audio" => Ok(CallKind::Audio),
            b"video" => Ok(CallKind::Video),
            b"both" => Ok(CallKind::Both),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<CallKind> for commons::CallKind {
    fn from(value: CallKind) -> Self {
        match value {
            CallKind::Audio => commons::CallKind::Audio,
            CallKind::Video => commons::CallKind::Video,
            CallKind::Both => commons::CallKind::Both,
        }
    }
}

impl From<commons::CallKind> for CallKind {
    fn from(value: commons::CallKind) -> Self {
        match value {
            commons::CallKind::Audio => CallKind::Audio,
            commons::CallKind::Video => CallKind::Video,
            commons::CallKind::Both => CallKind::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = PurchaseStatusType)]
pub enum PurchaseStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Refunded,
}

impl QueryId for PurchaseStatusType {
    type QueryId = PurchaseStatusType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<PurchaseStatusType, Pg> for PurchaseStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            PurchaseStatus::Pending => out.write_all(b"pending")?,
            PurchaseStatus::Confirmed => out.write_all(b"confirmed")?,
            PurchaseStatus::InProgress => out.write_all(b"in_progress")?,
            PurchaseStatus::Completed => out.write_all(b"completed")?,
            PurchaseStatus::Cancelled => out.write_all(b"cancelled")?,
            PurchaseStatus::Refunded => out.write_all(b"refunded")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<PurchaseStatusType, Pg> for PurchaseStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"pending" => Ok(PurchaseStatus::Pending),
            b"confirmed" => Ok(PurchaseStatus::Confirmed),
            b"in_progress" => Ok(PurchaseStatus::InProgress),
            b"completed" => Ok(PurchaseStatus::Completed),
            b"cancelled" => Ok(PurchaseStatus::Cancelled),
            b"refunded" => Ok(PurchaseStatus::Refunded),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<PurchaseStatus> for commons::PurchaseStatus {
    fn from(value: PurchaseStatus) -> Self {
        match value {
            PurchaseStatus::Pending => commons::PurchaseStatus::Pending,
            PurchaseStatus::Confirmed => commons::PurchaseStatus::Confirmed,
            PurchaseStatus::InProgress => commons::PurchaseStatus::InProgress,
            PurchaseStatus::Completed => commons::PurchaseStatus::Completed,
            PurchaseStatus::Cancelled => commons::PurchaseStatus::Cancelled,
            PurchaseStatus::Refunded => commons::PurchaseStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = SessionStatusType)]
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

impl QueryId for SessionStatusType {
    type QueryId = SessionStatusType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<SessionStatusType, Pg> for SessionStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            SessionStatus::Connecting => out.write_all(b"connecting")?,
            SessionStatus::Active => out.write_all(b"active")?,
            SessionStatus::Ended => out.write_all(b"ended")?,
            SessionStatus::Timeout => out.write_all(b"timeout")?,
            SessionStatus::Failed => out.write_all(b"failed")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<SessionStatusType, Pg> for SessionStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"connecting" => Ok(SessionStatus::Connecting),
            b"active" => Ok(SessionStatus::Active),
            b"ended" => Ok(SessionStatus::Ended),
            b"timeout" => Ok(SessionStatus::Timeout),
            b"failed" => Ok(SessionStatus::Failed),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<SessionStatus> for commons::SessionStatus {
    fn from(value: SessionStatus) -> Self {
        match value {
            SessionStatus::Connecting => commons::SessionStatus::Connecting,
            SessionStatus::Active => commons::SessionStatus::Active,
            SessionStatus::Ended => commons::SessionStatus::Ended,
            SessionStatus::Timeout => commons::SessionStatus::Timeout,
            SessionStatus::Failed => commons::SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = PayoutStatusType)]
pub enum PayoutStatus {
    Processing,
    Earned,
    Pending,
    Completed,
    Cancelled,
    Failed,
}

impl QueryId for PayoutStatusType {
    type QueryId = PayoutStatusType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<PayoutStatusType, Pg> for PayoutStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            PayoutStatus::Processing => out.write_all(b"processing")?,
            PayoutStatus::Earned => out.write_all(b"earned")?,
            PayoutStatus::Pending => out.write_all(b"pending")?,
            PayoutStatus::Completed => out.write_all(b"completed")?,
            PayoutStatus::Cancelled => out.write_all(b"cancelled")?,
            PayoutStatus::Failed => out.write_all(b"failed")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<PayoutStatusType, Pg> for PayoutStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"processing" => Ok(PayoutStatus::Processing),
            b"earned" => Ok(PayoutStatus::Earned),
            b"pending" => Ok(PayoutStatus::Pending),
            b"completed" => Ok(PayoutStatus::Completed),
            b"cancelled" => Ok(PayoutStatus::Cancelled),
            b"failed" => Ok(PayoutStatus::Failed),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<PayoutStatus> for commons::PayoutStatus {
    fn from(value: PayoutStatus) -> Self {
        match value {
            PayoutStatus::Processing => commons::PayoutStatus::Processing,
            PayoutStatus::Earned => commons::PayoutStatus::Earned,
            PayoutStatus::Pending => commons::PayoutStatus::Pending,
            PayoutStatus::Completed => commons::PayoutStatus::Completed,
            PayoutStatus::Cancelled => commons::PayoutStatus::Cancelled,
            PayoutStatus::Failed => commons::PayoutStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromSqlRow, AsExpression)]
#[diesel(sql_type = RejectionReasonType)]
pub enum RejectionReason {
    NotAvailable,
    Busy,
    NotInterested,
    Other,
}

impl QueryId for RejectionReasonType {
    type QueryId = RejectionReasonType;
    const HAS_STATIC_QUERY_ID: bool = false;

    fn query_id() -> Option<TypeId> {
        None
    }
}

impl ToSql<RejectionReasonType, Pg> for RejectionReason {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match *self {
            RejectionReason::NotAvailable => out.write_all(b"not_available")?,
            RejectionReason::Busy => out.write_all(b"busy")?,
            RejectionReason::NotInterested => out.write_all(b"not_interested")?,
            RejectionReason::Other => out.write_all(b"other")?,
        }
        Ok(IsNull::No)
    }
}

impl FromSql<RejectionReasonType, Pg> for RejectionReason {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        match bytes.as_bytes() {
            b"not_available" => Ok(RejectionReason::NotAvailable),
            b"busy" => Ok(RejectionReason::Busy),
            b"not_interested" => Ok(RejectionReason::NotInterested),
            b"other" => Ok(RejectionReason::Other),
            _ => Err("Unrecognized enum variant".into()),
        }
    }
}

impl From<commons::RejectionReason> for RejectionReason {
    fn from(value: commons::RejectionReason) -> Self {
        match value {
            commons::RejectionReason::NotAvailable => RejectionReason::NotAvailable,
            commons::RejectionReason::Busy => RejectionReason::Busy,
            commons::RejectionReason::NotInterested => RejectionReason::NotInterested,
            commons::RejectionReason::Other => RejectionReason::Other,
        }
    }
}
