use crate::db;
use crate::db::PgPool;
use crate::payments::PaymentGateway;
use anyhow::Context;
use diesel::Connection;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("No earned payouts to collect")]
    NothingToCollect,
    #[error("Balance does not cover the collectable payouts")]
    BalanceMismatch,
    #[error("Transfer failed: {0:#}")]
    Transfer(anyhow::Error),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct CollectionReceipt {
    pub transfer_ref: String,
    pub amount: Decimal,
    pub payouts: usize,
}

/// Collect a listener's withdrawable earnings: `earned -> pending` on the
/// non-extension payout rows, a guarded balance debit, then one transfer
/// through the gateway. The webhook's `kind=payout_collection` confirmation
/// later flips the rows to completed. If the transfer never goes out the
/// whole collection is unwound.
pub async fn collect_for_listener(
    pool: &PgPool,
    gateway: &Arc<dyn PaymentGateway>,
    listener_id: Uuid,
) -> Result<CollectionReceipt, CollectionError> {
    let transfer_ref = format!("collect_{}", Uuid::new_v4().simple());

    let mut conn = pool.get().context("Could not acquire db connection")?;
    let (amount, payouts) = conn.transaction::<(Decimal, usize), CollectionError, _>(|conn| {
        let collected = db::payouts::collect_earned(conn, listener_id, &transfer_ref)?;
        if collected.is_empty() {
            return Err(CollectionError::NothingToCollect);
        }

        let amount: Decimal = collected.iter().map(|p| p.amount).sum();
        if !db::balances::debit(conn, listener_id, amount)? {
            // Ledger and balance disagree; abort rather than overdraw.
            return Err(CollectionError::BalanceMismatch);
        }

        Ok((amount, collected.len()))
    })?;

    let description = format!("Payout collection for listener {listener_id}");
    if let Err(e) = gateway.transfer(amount, &transfer_ref, &description).await {
        // The money never left, so the rows go back to earned and the
        // balance is restored.
        tracing::error!(%listener_id, %transfer_ref, "Transfer failed, reverting collection: {e:#}");
        db::payouts::revert_collection(&mut conn, &transfer_ref)?;
        db::balances::restore(&mut conn, listener_id, amount)?;
        return Err(CollectionError::Transfer(e));
    }

    tracing::info!(%listener_id, %transfer_ref, %amount, payouts, "Payout collection started");

    Ok(CollectionReceipt {
        transfer_ref,
        amount,
        payouts,
    })
}
