use crate::collection;
use crate::collection::CollectionError;
use crate::db;
use crate::db::PgPool;
use crate::payments::PaymentGateway;
use anyhow::Result;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tokio_cron_scheduler::Job;
use tokio_cron_scheduler::JobScheduler;

/// Withdrawable earnings idle longer than this are collected without an
/// explicit listener request.
const COLLECTION_AGE_DAYS: i64 = 7;

/// Daily at 03:00.
const SWEEP_SCHEDULE: &str = "0 0 3 * * *";

pub async fn start(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(SWEEP_SCHEDULE, move |_uuid, _lock| {
        let pool = pool.clone();
        let gateway = gateway.clone();
        Box::pin(async move {
            if let Err(e) = sweep_idle_payouts(pool, gateway).await {
                tracing::error!("Payout collection sweep failed: {e:#}");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(schedule = SWEEP_SCHEDULE, "Started payout collection sweep");

    Ok(scheduler)
}

async fn sweep_idle_payouts(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Result<()> {
    let cutoff = OffsetDateTime::now_utc() - time::Duration::days(COLLECTION_AGE_DAYS);

    let listeners = spawn_blocking({
        let pool = pool.clone();
        move || -> Result<Vec<uuid::Uuid>> {
            let mut conn = pool.get()?;
            Ok(db::payouts::listeners_with_earned_before(&mut conn, cutoff)?)
        }
    })
    .await
    .expect("task to complete")?;

    if listeners.is_empty() {
        return Ok(());
    }
    tracing::info!(listeners = listeners.len(), "Sweeping idle earned payouts");

    for listener_id in listeners {
        match collection::collect_for_listener(&pool, &gateway, listener_id).await {
            Ok(receipt) => {
                tracing::info!(
                    %listener_id,
                    transfer_ref = %receipt.transfer_ref,
                    amount = %receipt.amount,
                    "Swept payouts into collection"
                );
            }
            // Someone collected manually between the query and now.
            Err(CollectionError::NothingToCollect) => {}
            Err(e) => {
                tracing::error!(%listener_id, "Sweep failed for listener: {e:#}");
            }
        }
    }

    Ok(())
}
