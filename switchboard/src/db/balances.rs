use crate::schema::listener_balances;
use diesel::prelude::*;
use diesel::upsert::excluded;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = listener_balances)]
pub struct ListenerBalance {
    pub listener_id: Uuid,
    pub available: Decimal,
    pub lifetime_earned: Decimal,
    pub updated_at: OffsetDateTime,
}

pub fn get(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Option<ListenerBalance>> {
    listener_balances::table
        .filter(listener_balances::listener_id.eq(listener_id))
        .first::<ListenerBalance>(conn)
        .optional()
}

/// Lock the listener's balance row for the rest of the transaction. All
/// credits go through this, which serializes them per listener.
pub fn lock(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<Option<ListenerBalance>> {
    listener_balances::table
        .filter(listener_balances::listener_id.eq(listener_id))
        .for_update()
        .first::<ListenerBalance>(conn)
        .optional()
}

/// Additive credit; creates the account row on first earnings.
pub fn credit(conn: &mut PgConnection, listener_id: Uuid, amount: Decimal) -> QueryResult<usize> {
    diesel::insert_into(listener_balances::table)
        .values((
            listener_balances::listener_id.eq(listener_id),
            listener_balances::available.eq(amount),
            listener_balances::lifetime_earned.eq(amount),
            listener_balances::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .on_conflict(listener_balances::listener_id)
        .do_update()
        .set((
            listener_balances::available
                .eq(listener_balances::available + excluded(listener_balances::available)),
            listener_balances::lifetime_earned
                .eq(listener_balances::lifetime_earned
                    + excluded(listener_balances::lifetime_earned)),
            listener_balances::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .execute(conn)
}

/// Put money back into `available` without touching `lifetime_earned`.
/// Used to unwind a payout collection whose transfer never went out.
pub fn restore(conn: &mut PgConnection, listener_id: Uuid, amount: Decimal) -> QueryResult<usize> {
    diesel::update(listener_balances::table)
        .set((
            listener_balances::available.eq(listener_balances::available + amount),
            listener_balances::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(listener_balances::listener_id.eq(listener_id))
        .execute(conn)
}

/// Guarded decrement. Matches 0 rows when the available balance does not
/// cover the amount; the caller treats that as "insufficient funds".
pub fn debit(conn: &mut PgConnection, listener_id: Uuid, amount: Decimal) -> QueryResult<bool> {
    let updated = diesel::update(listener_balances::table)
        .set((
            listener_balances::available.eq(listener_balances::available - amount),
            listener_balances::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(listener_balances::listener_id.eq(listener_id))
        .filter(listener_balances::available.ge(amount))
        .execute(conn)?;
    Ok(updated > 0)
}
