use crate::db::custom_types::CallKind;
use crate::db::custom_types::PurchaseStatus;
use crate::db::package_templates::PackageTemplate;
use crate::schema::purchases;
use diesel::prelude::*;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = purchases)]
pub struct Purchase {
    pub id: Uuid,
    pub talker_id: Uuid,
    pub listener_id: Uuid,
    pub template_id: Uuid,
    pub status: PurchaseStatus,
    pub kind: CallKind,
    pub duration_minutes: i32,
    pub total: Decimal,
    pub fee: Decimal,
    pub listener_amount: Decimal,
    pub is_extension: bool,
    pub session_id: Option<Uuid>,
    pub external_payment_ref: Option<String>,
    pub checkout_ref: Option<String>,
    pub used_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Purchase {
    pub fn to_api(&self) -> commons::PurchaseInfo {
        commons::PurchaseInfo {
            id: self.id,
            talker_id: self.talker_id,
            listener_id: self.listener_id,
            template_id: self.template_id,
            status: self.status.into(),
            kind: self.kind.into(),
            duration_minutes: self.duration_minutes,
            total: self.total,
            fee: self.fee,
            listener_amount: self.listener_amount,
            is_extension: self.is_extension,
            created_at: self.created_at,
        }
    }
}

/// Snapshot a template's pricing onto a new purchase row. The amounts are
/// frozen here; later template edits never touch them.
pub fn insert_snapshot(
    conn: &mut PgConnection,
    talker_id: Uuid,
    listener_id: Uuid,
    template: &PackageTemplate,
    is_extension: bool,
    session_id: Option<Uuid>,
) -> QueryResult<Purchase> {
    diesel::insert_into(purchases::table)
        .values((
            purchases::id.eq(Uuid::new_v4()),
            purchases::talker_id.eq(talker_id),
            purchases::listener_id.eq(listener_id),
            purchases::template_id.eq(template.id),
            purchases::status.eq(PurchaseStatus::Pending),
            purchases::kind.eq(template.kind),
            purchases::duration_minutes.eq(template.duration_minutes),
            purchases::total.eq(template.price),
            purchases::fee.eq(template.fee_amount()),
            purchases::listener_amount.eq(template.listener_amount()),
            purchases::is_extension.eq(is_extension),
            purchases::session_id.eq(session_id),
            purchases::created_at.eq(OffsetDateTime::now_utc()),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .get_result(conn)
}

pub fn get(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Purchase>> {
    purchases::table
        .filter(purchases::id.eq(id))
        .first::<Purchase>(conn)
        .optional()
}

pub fn by_external_payment_ref(
    conn: &mut PgConnection,
    external_ref: &str,
) -> QueryResult<Option<Purchase>> {
    purchases::table
        .filter(purchases::external_payment_ref.eq(external_ref))
        .first::<Purchase>(conn)
        .optional()
}

pub fn set_checkout_ref(conn: &mut PgConnection, id: Uuid, checkout_ref: &str) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::checkout_ref.eq(checkout_ref),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .execute(conn)
}

/// `pending -> confirmed` with the processor's payment reference. Returns 0
/// rows for anything but a pending purchase, which makes webhook replays
/// harmless.
pub fn confirm_pending(
    conn: &mut PgConnection,
    id: Uuid,
    external_ref: &str,
) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::Confirmed),
            purchases::external_payment_ref.eq(external_ref),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::status.eq(PurchaseStatus::Pending))
        .execute(conn)
}

/// Confirm an extension and stamp it used in one step. `used_at` is the
/// idempotency anchor for ExtendApply: the first delivery flips it, every
/// replay matches 0 rows.
pub fn confirm_extension_used(
    conn: &mut PgConnection,
    id: Uuid,
    external_ref: &str,
) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::Confirmed),
            purchases::external_payment_ref.eq(external_ref),
            purchases::used_at.eq(OffsetDateTime::now_utc()),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::used_at.is_null())
        .filter(purchases::status.eq_any([PurchaseStatus::Pending, PurchaseStatus::Confirmed]))
        .execute(conn)
}

/// Advance the initial purchase when the listener accepts.
pub fn mark_in_progress(conn: &mut PgConnection, id: Uuid) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::InProgress),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::status.eq(PurchaseStatus::Confirmed))
        .execute(conn)
}

/// Close out every purchase that participated in a session.
pub fn complete_for_session(conn: &mut PgConnection, session_id: Uuid) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::Completed),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::session_id.eq(session_id))
        .filter(purchases::status.eq_any([PurchaseStatus::Confirmed, PurchaseStatus::InProgress]))
        .execute(conn)
}

pub fn cancel(conn: &mut PgConnection, id: Uuid, reason: &str) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::Cancelled),
            purchases::cancellation_reason.eq(reason),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::status.eq_any([PurchaseStatus::Pending, PurchaseStatus::Confirmed]))
        .execute(conn)
}

/// `-> refunded`, from any non-terminal status. Returns 0 rows if the
/// purchase was already refunded, so a second refund request is a no-op.
pub fn mark_refunded(conn: &mut PgConnection, id: Uuid, reason: &str) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::status.eq(PurchaseStatus::Refunded),
            purchases::cancellation_reason.eq(reason),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::status.ne(PurchaseStatus::Refunded))
        .execute(conn)
}

/// Remove a pending purchase whose checkout link never materialized.
/// Keeps failed gateway calls from leaving local state behind.
pub fn delete_pending(conn: &mut PgConnection, id: Uuid) -> QueryResult<usize> {
    diesel::delete(purchases::table)
        .filter(purchases::id.eq(id))
        .filter(purchases::status.eq(PurchaseStatus::Pending))
        .execute(conn)
}

/// Bind the initial purchase to the session it opened. Guarded so a second
/// allocation attempt for the same purchase matches 0 rows.
pub fn link_session(conn: &mut PgConnection, id: Uuid, session_id: Uuid) -> QueryResult<usize> {
    diesel::update(purchases::table)
        .set((
            purchases::session_id.eq(session_id),
            purchases::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(purchases::id.eq(id))
        .filter(purchases::session_id.is_null())
        .execute(conn)
}

/// All purchases funding a session (initial plus extensions) that made it
/// to a money-bearing status.
pub fn funding_session(conn: &mut PgConnection, session_id: Uuid) -> QueryResult<Vec<Purchase>> {
    purchases::table
        .filter(purchases::session_id.eq(session_id))
        .filter(purchases::status.eq_any([
            PurchaseStatus::Confirmed,
            PurchaseStatus::InProgress,
            PurchaseStatus::Completed,
        ]))
        .order(purchases::created_at.asc())
        .load::<Purchase>(conn)
}
