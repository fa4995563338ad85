use crate::db::custom_types::CallKind;
use crate::db::custom_types::SessionStatus;
use crate::schema::call_sessions;
use diesel::prelude::*;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = call_sessions)]
pub struct Session {
    pub id: Uuid,
    pub talker_id: Uuid,
    pub listener_id: Uuid,
    pub initial_purchase_id: Uuid,
    pub status: SessionStatus,
    pub kind: CallKind,
    pub total_minutes_purchased: i32,
    pub minutes_used: Option<Decimal>,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub end_reason: Option<String>,
    pub warning_sent: bool,
    pub media_channel: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Session {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.talker_id == user_id || self.listener_id == user_id
    }

    pub fn to_api(&self) -> commons::SessionInfo {
        commons::SessionInfo {
            id: self.id,
            talker_id: self.talker_id,
            listener_id: self.listener_id,
            status: self.status.into(),
            kind: self.kind.into(),
            total_minutes_purchased: self.total_minutes_purchased,
            minutes_used: self.minutes_used,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

pub fn insert(
    conn: &mut PgConnection,
    id: Uuid,
    talker_id: Uuid,
    listener_id: Uuid,
    initial_purchase_id: Uuid,
    kind: CallKind,
    total_minutes: i32,
    media_channel: &str,
) -> QueryResult<Session> {
    diesel::insert_into(call_sessions::table)
        .values((
            call_sessions::id.eq(id),
            call_sessions::talker_id.eq(talker_id),
            call_sessions::listener_id.eq(listener_id),
            call_sessions::initial_purchase_id.eq(initial_purchase_id),
            call_sessions::status.eq(SessionStatus::Connecting),
            call_sessions::kind.eq(kind),
            call_sessions::total_minutes_purchased.eq(total_minutes),
            call_sessions::warning_sent.eq(false),
            call_sessions::media_channel.eq(media_channel),
            call_sessions::created_at.eq(OffsetDateTime::now_utc()),
            call_sessions::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .get_result(conn)
}

pub fn get(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Session>> {
    call_sessions::table
        .filter(call_sessions::id.eq(id))
        .first::<Session>(conn)
        .optional()
}

/// `connecting -> active`, stamping the authoritative start of the
/// countdown. Returns 0 rows unless the session was still connecting.
pub fn accept(conn: &mut PgConnection, id: Uuid, now: OffsetDateTime) -> QueryResult<usize> {
    diesel::update(call_sessions::table)
        .set((
            call_sessions::status.eq(SessionStatus::Active),
            call_sessions::started_at.eq(now),
            call_sessions::updated_at.eq(now),
        ))
        .filter(call_sessions::id.eq(id))
        .filter(call_sessions::status.eq(SessionStatus::Connecting))
        .execute(conn)
}

/// Terminal transition to `ended` or `timeout`. Guarded on the current
/// status so two racing enders produce a single transition.
pub fn terminate(
    conn: &mut PgConnection,
    id: Uuid,
    status: SessionStatus,
    minutes_used: Decimal,
    end_reason: &str,
    now: OffsetDateTime,
) -> QueryResult<usize> {
    debug_assert!(matches!(
        status,
        SessionStatus::Ended | SessionStatus::Timeout
    ));
    diesel::update(call_sessions::table)
        .set((
            call_sessions::status.eq(status),
            call_sessions::minutes_used.eq(minutes_used),
            call_sessions::ended_at.eq(now),
            call_sessions::end_reason.eq(end_reason),
            call_sessions::updated_at.eq(now),
        ))
        .filter(call_sessions::id.eq(id))
        .filter(call_sessions::status.eq_any([SessionStatus::Connecting, SessionStatus::Active]))
        .execute(conn)
}

/// `connecting -> failed` when the initial purchase dies before acceptance.
pub fn fail(conn: &mut PgConnection, id: Uuid, reason: &str) -> QueryResult<usize> {
    let now = OffsetDateTime::now_utc();
    diesel::update(call_sessions::table)
        .set((
            call_sessions::status.eq(SessionStatus::Failed),
            call_sessions::ended_at.eq(now),
            call_sessions::end_reason.eq(reason),
            call_sessions::updated_at.eq(now),
        ))
        .filter(call_sessions::id.eq(id))
        .filter(call_sessions::status.eq(SessionStatus::Connecting))
        .execute(conn)
}

/// Grow the purchased budget. Only ever adds; the column never decreases.
pub fn add_minutes(conn: &mut PgConnection, id: Uuid, added: i32) -> QueryResult<usize> {
    diesel::update(call_sessions::table)
        .set((
            call_sessions::total_minutes_purchased
                .eq(call_sessions::total_minutes_purchased + added),
            call_sessions::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(call_sessions::id.eq(id))
        .filter(call_sessions::status.eq_any([SessionStatus::Connecting, SessionStatus::Active]))
        .execute(conn)
}

/// At-most-once guard for the low-time warning; the flag is persistent so
/// a runner restart cannot re-warn.
pub fn mark_warning_sent(conn: &mut PgConnection, id: Uuid) -> QueryResult<usize> {
    diesel::update(call_sessions::table)
        .set((
            call_sessions::warning_sent.eq(true),
            call_sessions::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(call_sessions::id.eq(id))
        .filter(call_sessions::warning_sent.eq(false))
        .execute(conn)
}

/// Sessions currently ringing for a listener (allocated, not yet accepted).
pub fn ringing_for_listener(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Vec<Session>> {
    call_sessions::table
        .filter(call_sessions::listener_id.eq(listener_id))
        .filter(call_sessions::status.eq(SessionStatus::Connecting))
        .order(call_sessions::created_at.desc())
        .load::<Session>(conn)
}
