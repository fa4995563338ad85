use crate::db;
use crate::db::custom_types::PayoutStatus;
use crate::payments::gateway::verify_webhook_signature;
use crate::payments::CheckoutKind;
use crate::payments::CheckoutMetadata;
use crate::routes::AppState;
use crate::session::ExtendOutcome;
use crate::AppError;
use anyhow::Context;
use anyhow::Result;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use commons::EndReason;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "stripe-signature";
const REFUND_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Signed payment-event consumer. Every handler tolerates duplicate
/// delivery; a 2xx acknowledges the event, a 5xx makes the processor
/// redeliver it, which is the retry mechanism for transient store
/// failures.
pub async fn post_payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("Missing signature header".to_string()))?;

    let secret = state.settings.read().await.payment_webhook_secret.clone();
    verify_webhook_signature(&secret, &body, signature)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook signature: {e}")))?;

    let event: WebhookEvent = serde_json::from_str(&body)
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook body: {e}")))?;

    tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Processing payment event");

    let result = match event.event_type.as_str() {
        "checkout.session.completed" => handle_checkout_completed(&state, &event.data.object).await,
        "payment_intent.payment_failed" => handle_payment_failed(&state, &event.data.object).await,
        "charge.refunded" => handle_charge_refunded(&state, &event.data.object).await,
        other => {
            // Acknowledge everything we don't interpret.
            tracing::debug!(event_type = other, "Ignoring unrecognized payment event");
            Ok(())
        }
    };

    result.map_err(|e| {
        AppError::InternalServerError(format!("Failed to process payment event: {e:#}"))
    })?;

    Ok(StatusCode::OK)
}

async fn handle_checkout_completed(
    state: &Arc<AppState>,
    object: &serde_json::Value,
) -> Result<()> {
    let Some(metadata) = CheckoutMetadata::from_object(object) else {
        tracing::debug!("Checkout completion without recognizable metadata, acknowledging");
        return Ok(());
    };

    let payment_ref = object
        .get("payment_intent")
        .and_then(|v| v.as_str())
        .or_else(|| object.get("id").and_then(|v| v.as_str()))
        .context("Checkout completion without payment reference")?
        .to_string();

    match metadata.kind {
        CheckoutKind::Initial => {
            let purchase_id = metadata
                .purchase_id
                .context("Initial checkout without purchase_id")?;
            confirm_initial_purchase(state, purchase_id, &payment_ref).await
        }
        CheckoutKind::Extension => {
            let purchase_id = metadata
                .purchase_id
                .context("Extension checkout without purchase_id")?;
            let session_id = metadata
                .session_id
                .context("Extension checkout without session_id")?;
            apply_extension(state, session_id, purchase_id, &payment_ref).await
        }
        CheckoutKind::PayoutCollection => {
            let transfer_ref = metadata
                .transfer_ref
                .context("Payout collection without transfer_ref")?;
            let mut conn = state.pool.get()?;
            let completed = db::payouts::complete_by_transfer_ref(&mut conn, &transfer_ref)?;
            tracing::info!(%transfer_ref, completed, "Payout collection completed");
            Ok(())
        }
    }
}

/// `pending -> confirmed` plus the `processing` ledger row, atomically.
/// Replays match 0 rows on the conditional update and write nothing.
async fn confirm_initial_purchase(
    state: &Arc<AppState>,
    purchase_id: Uuid,
    payment_ref: &str,
) -> Result<()> {
    use diesel::Connection;

    let mut conn = state.pool.get()?;

    conn.transaction::<(), anyhow::Error, _>(|conn| {
        let confirmed = db::purchases::confirm_pending(conn, purchase_id, payment_ref)?;
        if confirmed == 0 {
            tracing::debug!(%purchase_id, "Purchase already confirmed, acknowledging replay");
            return Ok(());
        }

        let purchase =
            db::purchases::get(conn, purchase_id)?.context("Confirmed purchase vanished")?;

        db::payouts::insert(
            conn,
            purchase.listener_id,
            purchase.id,
            purchase.listener_amount,
            PayoutStatus::Processing,
            false,
        )?;

        tracing::info!(
            %purchase_id,
            listener_id = %purchase.listener_id,
            amount = %purchase.listener_amount,
            "Purchase confirmed, payout record created"
        );

        Ok(())
    })
}

async fn apply_extension(
    state: &Arc<AppState>,
    session_id: Uuid,
    purchase_id: Uuid,
    payment_ref: &str,
) -> Result<()> {
    let outcome = state
        .engine
        .extend_apply(session_id, purchase_id, payment_ref)
        .await
        .context("Failed to apply extension")?;

    match outcome {
        ExtendOutcome::Applied { .. } => Ok(()),
        ExtendOutcome::Duplicate => {
            tracing::debug!(%purchase_id, "Extension already applied, acknowledging replay");
            Ok(())
        }
        ExtendOutcome::RefundRequired { .. } => {
            tracing::warn!(
                %purchase_id,
                %session_id,
                "Extension paid after call ended, refunding"
            );
            refund_with_retry(state, payment_ref, "Call ended before extension was applied").await;
            Ok(())
        }
    }
}

async fn handle_payment_failed(state: &Arc<AppState>, object: &serde_json::Value) -> Result<()> {
    let mut conn = state.pool.get()?;

    // Payment-intent events carry our metadata when we tagged the intent;
    // fall back to the stored payment reference otherwise.
    let purchase = match CheckoutMetadata::from_object(object).and_then(|m| m.purchase_id) {
        Some(purchase_id) => db::purchases::get(&mut conn, purchase_id)?,
        None => {
            let payment_ref = object.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            db::purchases::by_external_payment_ref(&mut conn, payment_ref)?
        }
    };

    let Some(purchase) = purchase else {
        tracing::debug!("Payment failure for unknown purchase, acknowledging");
        return Ok(());
    };

    let cancelled = db::purchases::cancel(&mut conn, purchase.id, "Payment failed")?;
    if cancelled == 0 {
        return Ok(());
    }
    tracing::warn!(purchase_id = %purchase.id, "Purchase cancelled after failed payment");

    fail_connecting_session(state, &purchase, EndReason::PaymentFailed).await
}

async fn handle_charge_refunded(state: &Arc<AppState>, object: &serde_json::Value) -> Result<()> {
    let payment_ref = object
        .get("payment_intent")
        .and_then(|v| v.as_str())
        .context("Refund event without payment reference")?;

    let mut conn = state.pool.get()?;
    let Some(purchase) = db::purchases::by_external_payment_ref(&mut conn, payment_ref)? else {
        tracing::debug!(payment_ref, "Refund for unknown purchase, acknowledging");
        return Ok(());
    };

    let refunded = db::purchases::mark_refunded(&mut conn, purchase.id, "Charge refunded")?;
    if refunded == 0 {
        tracing::debug!(purchase_id = %purchase.id, "Purchase already refunded, acknowledging replay");
        return Ok(());
    }

    db::payouts::cancel_for_purchase(&mut conn, purchase.id)?;
    tracing::info!(purchase_id = %purchase.id, "Purchase refunded, payout cancelled");

    fail_connecting_session(state, &purchase, EndReason::PaymentFailed).await
}

/// A dead initial purchase takes its still-connecting session down with it.
async fn fail_connecting_session(
    state: &Arc<AppState>,
    purchase: &db::purchases::Purchase,
    reason: EndReason,
) -> Result<()> {
    if purchase.is_extension {
        return Ok(());
    }
    let Some(session_id) = purchase.session_id else {
        return Ok(());
    };

    state
        .engine
        .fail_connecting(session_id, reason)
        .await
        .context("Failed to fail connecting session")?;

    Ok(())
}

/// Bounded-backoff refund. The refund endpoint is idempotent on the
/// processor side, so hammering it a few times is safe.
async fn refund_with_retry(state: &Arc<AppState>, payment_ref: &str, reason: &str) {
    for attempt in 1..=REFUND_ATTEMPTS {
        match state.gateway.refund(payment_ref, reason).await {
            Ok(receipt) => {
                tracing::info!(payment_ref, refund_ref = %receipt.refund_ref, "Refund issued");
                return;
            }
            Err(e) => {
                tracing::warn!(payment_ref, attempt, "Refund attempt failed: {e:#}");
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
            }
        }
    }

    tracing::error!(payment_ref, "Giving up on refund after {REFUND_ATTEMPTS} attempts");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_events_parse_the_processor_shape() {
        let body = r#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_test_1",
                    "payment_intent": "pi_test_1",
                    "metadata": {
                        "kind": "initial",
                        "purchase_id": "6b8ad95e-95a9-4f50-bbf8-6f4792de8e35"
                    }
                }
            }
        }"#;

        let event: WebhookEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, "checkout.session.completed");

        let metadata = CheckoutMetadata::from_object(&event.data.object).unwrap();
        assert_eq!(metadata.kind, CheckoutKind::Initial);
        assert_eq!(
            metadata.purchase_id,
            Some(Uuid::parse_str("6b8ad95e-95a9-4f50-bbf8-6f4792de8e35").unwrap())
        );
    }

    #[test]
    fn events_without_data_object_fail_to_parse() {
        assert!(serde_json::from_str::<WebhookEvent>(r#"{"id":"evt_1","type":"x"}"#).is_err());
    }
}
