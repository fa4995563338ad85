use crate::db::custom_types::PayoutStatus;
use crate::schema::payout_records;
use diesel::prelude::*;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = payout_records)]
pub struct PayoutRecord {
    pub id: Uuid,
    pub listener_id: Uuid,
    pub purchase_id: Uuid,
    pub amount: Decimal,
    pub status: PayoutStatus,
    pub is_extension: bool,
    pub external_transfer_ref: Option<String>,
    pub earned_at: OffsetDateTime,
    pub collected_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PayoutRecord {
    pub fn to_api(&self) -> commons::PayoutInfo {
        commons::PayoutInfo {
            id: self.id,
            purchase_id: self.purchase_id,
            amount: self.amount,
            status: self.status.into(),
            is_extension: self.is_extension,
            earned_at: self.earned_at,
        }
    }
}

/// One ledger row per confirmed purchase, keyed by the purchase id. The
/// unique index absorbs webhook replays: the second insert matches the
/// conflict target and writes nothing.
pub fn insert(
    conn: &mut PgConnection,
    listener_id: Uuid,
    purchase_id: Uuid,
    amount: Decimal,
    status: PayoutStatus,
    is_extension: bool,
) -> QueryResult<usize> {
    let now = OffsetDateTime::now_utc();
    diesel::insert_into(payout_records::table)
        .values((
            payout_records::id.eq(Uuid::new_v4()),
            payout_records::listener_id.eq(listener_id),
            payout_records::purchase_id.eq(purchase_id),
            payout_records::amount.eq(amount),
            payout_records::status.eq(status),
            payout_records::is_extension.eq(is_extension),
            payout_records::earned_at.eq(now),
            payout_records::created_at.eq(now),
            payout_records::updated_at.eq(now),
        ))
        .on_conflict(payout_records::purchase_id)
        .do_nothing()
        .execute(conn)
}

pub fn by_purchase(conn: &mut PgConnection, purchase_id: Uuid) -> QueryResult<Option<PayoutRecord>> {
    payout_records::table
        .filter(payout_records::purchase_id.eq(purchase_id))
        .first::<PayoutRecord>(conn)
        .optional()
}

pub fn for_listener(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Vec<PayoutRecord>> {
    payout_records::table
        .filter(payout_records::listener_id.eq(listener_id))
        .order(payout_records::earned_at.desc())
        .load::<PayoutRecord>(conn)
}

/// `processing -> earned` for one purchase, at session end. The 0-or-1
/// row count tells the caller whether this purchase still needs its
/// balance credit.
pub fn mark_earned(conn: &mut PgConnection, purchase_id: Uuid) -> QueryResult<usize> {
    diesel::update(payout_records::table)
        .set((
            payout_records::status.eq(PayoutStatus::Earned),
            payout_records::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(payout_records::purchase_id.eq(purchase_id))
        .filter(payout_records::status.eq(PayoutStatus::Processing))
        .execute(conn)
}

/// Cancel the ledger row of a refunded purchase.
pub fn cancel_for_purchase(conn: &mut PgConnection, purchase_id: Uuid) -> QueryResult<usize> {
    diesel::update(payout_records::table)
        .set((
            payout_records::status.eq(PayoutStatus::Cancelled),
            payout_records::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(payout_records::purchase_id.eq(purchase_id))
        .filter(payout_records::status.eq_any([PayoutStatus::Processing, PayoutStatus::Earned]))
        .execute(conn)
}

/// Move a listener's withdrawable rows into collection. Extensions stay
/// behind: they are visible in the ledger but never leave through this
/// path.
pub fn collect_earned(
    conn: &mut PgConnection,
    listener_id: Uuid,
    transfer_ref: &str,
) -> QueryResult<Vec<PayoutRecord>> {
    let now = OffsetDateTime::now_utc();
    diesel::update(payout_records::table)
        .set((
            payout_records::status.eq(PayoutStatus::Pending),
            payout_records::external_transfer_ref.eq(transfer_ref),
            payout_records::collected_at.eq(now),
            payout_records::updated_at.eq(now),
        ))
        .filter(payout_records::listener_id.eq(listener_id))
        .filter(payout_records::status.eq(PayoutStatus::Earned))
        .filter(payout_records::is_extension.eq(false))
        .get_results(conn)
}

/// Unwind a collection whose transfer never left the building: the rows
/// go back to `earned` and lose their transfer reference.
pub fn revert_collection(conn: &mut PgConnection, transfer_ref: &str) -> QueryResult<usize> {
    diesel::update(payout_records::table)
        .set((
            payout_records::status.eq(PayoutStatus::Earned),
            payout_records::external_transfer_ref.eq(None::<String>),
            payout_records::collected_at.eq(None::<OffsetDateTime>),
            payout_records::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(payout_records::external_transfer_ref.eq(transfer_ref))
        .filter(payout_records::status.eq(PayoutStatus::Pending))
        .execute(conn)
}

/// Listeners with withdrawable earnings that have been sitting since
/// before the cutoff. Feeds the scheduled collection sweep.
pub fn listeners_with_earned_before(
    conn: &mut PgConnection,
    cutoff: OffsetDateTime,
) -> QueryResult<Vec<Uuid>> {
    payout_records::table
        .filter(payout_records::status.eq(PayoutStatus::Earned))
        .filter(payout_records::is_extension.eq(false))
        .filter(payout_records::earned_at.lt(cutoff))
        .select(payout_records::listener_id)
        .distinct()
        .load(conn)
}

/// `pending -> completed` when the processor confirms the transfer.
pub fn complete_by_transfer_ref(
    conn: &mut PgConnection,
    transfer_ref: &str,
) -> QueryResult<usize> {
    let now = OffsetDateTime::now_utc();
    diesel::update(payout_records::table)
        .set((
            payout_records::status.eq(PayoutStatus::Completed),
            payout_records::completed_at.eq(now),
            payout_records::updated_at.eq(now),
        ))
        .filter(payout_records::external_transfer_ref.eq(transfer_ref))
        .filter(payout_records::status.eq(PayoutStatus::Pending))
        .execute(conn)
}

/// Sum of non-extension rows in {earned, pending}: the withdrawable figure.
pub fn withdrawable_sum(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Decimal> {
    let sum: Option<Decimal> = payout_records::table
        .filter(payout_records::listener_id.eq(listener_id))
        .filter(payout_records::status.eq_any([PayoutStatus::Earned, PayoutStatus::Pending]))
        .filter(payout_records::is_extension.eq(false))
        .select(diesel::dsl::sum(payout_records::amount))
        .first(conn)?;
    Ok(sum.unwrap_or(Decimal::ZERO))
}

/// Extension earnings tracked separately from the withdrawable figure.
pub fn extension_sum(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Decimal> {
    let sum: Option<Decimal> = payout_records::table
        .filter(payout_records::listener_id.eq(listener_id))
        .filter(payout_records::status.eq_any([PayoutStatus::Earned, PayoutStatus::Pending]))
        .filter(payout_records::is_extension.eq(true))
        .select(diesel::dsl::sum(payout_records::amount))
        .first(conn)?;
    Ok(sum.unwrap_or(Decimal::ZERO))
}
