use crate::db::custom_types::RejectionReason;
use crate::schema::rejection_records;
use diesel::prelude::*;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = rejection_records)]
pub struct RejectionRecord {
    pub id: Uuid,
    pub purchase_id: Uuid,
    pub session_id: Uuid,
    pub listener_id: Uuid,
    pub talker_id: Uuid,
    pub reason: RejectionReason,
    pub notes: Option<String>,
    pub refund_issued: bool,
    pub refund_amount: Decimal,
    pub refund_ref: Option<String>,
    pub refunded_at: Option<OffsetDateTime>,
    pub rejected_at: OffsetDateTime,
}

pub fn insert(
    conn: &mut PgConnection,
    purchase_id: Uuid,
    session_id: Uuid,
    listener_id: Uuid,
    talker_id: Uuid,
    reason: RejectionReason,
    notes: Option<&str>,
) -> QueryResult<RejectionRecord> {
    diesel::insert_into(rejection_records::table)
        .values((
            rejection_records::id.eq(Uuid::new_v4()),
            rejection_records::purchase_id.eq(purchase_id),
            rejection_records::session_id.eq(session_id),
            rejection_records::listener_id.eq(listener_id),
            rejection_records::talker_id.eq(talker_id),
            rejection_records::reason.eq(reason),
            rejection_records::notes.eq(notes),
            rejection_records::refund_issued.eq(false),
            rejection_records::refund_amount.eq(Decimal::ZERO),
            rejection_records::rejected_at.eq(OffsetDateTime::now_utc()),
        ))
        .get_result(conn)
}

pub fn by_purchase(
    conn: &mut PgConnection,
    purchase_id: Uuid,
) -> QueryResult<Option<RejectionRecord>> {
    rejection_records::table
        .filter(rejection_records::purchase_id.eq(purchase_id))
        .first::<RejectionRecord>(conn)
        .optional()
}

pub fn mark_refunded(
    conn: &mut PgConnection,
    id: Uuid,
    refund_amount: Decimal,
    refund_ref: &str,
) -> QueryResult<usize> {
    diesel::update(rejection_records::table)
        .set((
            rejection_records::refund_issued.eq(true),
            rejection_records::refund_amount.eq(refund_amount),
            rejection_records::refund_ref.eq(refund_ref),
            rejection_records::refunded_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(rejection_records::id.eq(id))
        .filter(rejection_records::refund_issued.eq(false))
        .execute(conn)
}
