use crate::availability;
use crate::db;
use crate::db::custom_types::PurchaseStatus;
use crate::db::custom_types::SessionStatus;
use crate::db::custom_types::UserRole;
use crate::media::MediaRole;
use crate::media::MediaTokenIssuer;
use crate::payments::CheckoutMetadata;
use crate::routes::AppState;
use commons::CheckoutReceipt;
use commons::EndReason;
use commons::Event;
use commons::ListenerHint;
use commons::SessionAllocation;
use diesel::Connection;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PurchaseError {
    #[error("Package not found or not active")]
    TemplateUnavailable,
    #[error("Listener not found")]
    ListenerNotFound,
    #[error("Listener is not available right now")]
    ListenerBusy { alternatives: Vec<ListenerHint> },
    #[error("Purchase not found")]
    PurchaseNotFound,
    #[error("Call session not found or not active")]
    SessionUnavailable,
    #[error("Only the talker of this call can do that")]
    NotTheTalker,
    #[error("Only the listener of this call can do that")]
    NotTheListener,
    #[error("Extensions cannot open a session")]
    NotAnInitialPurchase,
    #[error("Purchase is not confirmed")]
    NotConfirmed,
    #[error("A session already exists for this purchase")]
    AlreadyAllocated,
    #[error("Call is in the wrong state: {0}")]
    WrongState(String),
    #[error("Payment processor error: {0:#}")]
    Upstream(anyhow::Error),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
pub struct CreatePurchaseParams {
    pub listener_id: Uuid,
    pub template_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateExtensionParams {
    pub session_id: Uuid,
    pub template_id: Uuid,
}

#[derive(Debug)]
pub struct RejectionOutcome {
    pub refund_ref: Option<String>,
    pub refund_amount: Decimal,
    /// The purchase was already refunded; nothing was attempted again.
    pub duplicate: bool,
}

/// Create the initial purchase for a talker → listener call and hand back
/// the hosted checkout link. Nothing is persisted when the listener is
/// busy; the rejection carries a handful of free alternatives instead.
pub async fn create_initial_purchase(
    state: &Arc<AppState>,
    talker_id: Uuid,
    params: CreatePurchaseParams,
) -> Result<CheckoutReceipt, PurchaseError> {
    let mut conn = state.conn()?;

    let template = db::package_templates::get(&mut conn, params.template_id)?
        .filter(|t| t.active)
        .ok_or(PurchaseError::TemplateUnavailable)?;

    let listener = db::users::get(&mut conn, params.listener_id)?
        .filter(|u| u.role == UserRole::Listener)
        .ok_or(PurchaseError::ListenerNotFound)?;

    // Availability check and purchase creation share the listener's lock,
    // so two concurrent buyers cannot both pass `is_free`.
    let lock = state.listener_locks.acquire(listener.id);
    let _guard = lock.lock().await;

    if !availability::is_free(&mut conn, listener.id)? {
        let alternatives = availability::free_listeners(&mut conn, listener.id)?;
        return Err(PurchaseError::ListenerBusy { alternatives });
    }

    let purchase =
        db::purchases::insert_snapshot(&mut conn, talker_id, listener.id, &template, false, None)?;

    tracing::info!(
        purchase_id = %purchase.id,
        %talker_id,
        listener_id = %listener.id,
        total = %purchase.total,
        "Created initial purchase"
    );

    checkout_for_purchase(state, &mut conn, purchase, &template.name, MetadataShape::Initial).await
}

/// Top-up purchase bound to a live session.
pub async fn create_extension_purchase(
    state: &Arc<AppState>,
    talker_id: Uuid,
    params: CreateExtensionParams,
) -> Result<CheckoutReceipt, PurchaseError> {
    let mut conn = state.conn()?;

    let session = db::sessions::get(&mut conn, params.session_id)?
        .ok_or(PurchaseError::SessionUnavailable)?;
    if session.talker_id != talker_id {
        return Err(PurchaseError::NotTheTalker);
    }
    if !matches!(
        session.status,
        SessionStatus::Connecting | SessionStatus::Active
    ) {
        return Err(PurchaseError::SessionUnavailable);
    }

    let template = db::package_templates::get(&mut conn, params.template_id)?
        .filter(|t| t.active)
        .ok_or(PurchaseError::TemplateUnavailable)?;

    let purchase = db::purchases::insert_snapshot(
        &mut conn,
        talker_id,
        session.listener_id,
        &template,
        true,
        Some(session.id),
    )?;

    tracing::info!(
        purchase_id = %purchase.id,
        session_id = %session.id,
        added_minutes = template.duration_minutes,
        "Created extension purchase"
    );

    let description = format!("Extend call - {}", template.name);
    checkout_for_purchase(
        state,
        &mut conn,
        purchase,
        &description,
        MetadataShape::Extension {
            session_id: session.id,
        },
    )
    .await
}

/// Ask the gateway for a checkout link; unwind the pending row if the
/// processor is down so local state stays untouched.
async fn checkout_for_purchase(
    state: &Arc<AppState>,
    conn: &mut diesel::PgConnection,
    purchase: db::purchases::Purchase,
    description: &str,
    metadata_shape: MetadataShape,
) -> Result<CheckoutReceipt, PurchaseError> {
    let (success_url, default_cancel_url, frontend_base_url) = {
        let settings = state.settings.read().await;
        (
            settings.checkout_success_url.clone(),
            settings.checkout_cancel_url.clone(),
            settings.frontend_base_url.clone(),
        )
    };

    // Cancelling an extension checkout drops the talker back into the
    // running call instead of the generic cancel page.
    let (metadata, cancel_url) = match metadata_shape {
        MetadataShape::Initial => (CheckoutMetadata::initial(purchase.id), default_cancel_url),
        MetadataShape::Extension { session_id } => {
            let cancel_url = url::Url::parse(&frontend_base_url)
                .and_then(|base| base.join(&format!("call/{session_id}")))
                .map(String::from)
                .unwrap_or(default_cancel_url);
            (
                CheckoutMetadata::extension(purchase.id, session_id),
                cancel_url,
            )
        }
    };

    let description = format!("{description} ({} min)", purchase.duration_minutes);
    let checkout = match state
        .gateway
        .create_checkout(
            purchase.total,
            &description,
            &metadata,
            &success_url,
            &cancel_url,
        )
        .await
    {
        Ok(checkout) => checkout,
        Err(e) => {
            db::purchases::delete_pending(conn, purchase.id)?;
            return Err(PurchaseError::Upstream(e));
        }
    };

    db::purchases::set_checkout_ref(conn, purchase.id, &checkout.checkout_ref)?;

    Ok(CheckoutReceipt {
        purchase: purchase.to_api(),
        checkout_url: checkout.url,
    })
}

/// Which metadata to attach once the purchase row exists.
enum MetadataShape {
    Initial,
    Extension { session_id: Uuid },
}

#[derive(Debug, Deserialize)]
pub struct AllocateParams {
    pub purchase_id: Uuid,
}

/// Turn a confirmed purchase into a `connecting` session and ring the
/// listener. Runs under the listener's lock so it cannot race another
/// allocation or purchase past the availability check.
pub async fn allocate_session(
    state: &Arc<AppState>,
    talker_id: Uuid,
    params: AllocateParams,
) -> Result<SessionAllocation, PurchaseError> {
    let mut conn = state.conn()?;

    let purchase = db::purchases::get(&mut conn, params.purchase_id)?
        .ok_or(PurchaseError::PurchaseNotFound)?;
    if purchase.talker_id != talker_id {
        return Err(PurchaseError::NotTheTalker);
    }
    if purchase.is_extension {
        return Err(PurchaseError::NotAnInitialPurchase);
    }
    if purchase.status != PurchaseStatus::Confirmed {
        return Err(PurchaseError::NotConfirmed);
    }
    if purchase.session_id.is_some() {
        return Err(PurchaseError::AlreadyAllocated);
    }

    let lock = state.listener_locks.acquire(purchase.listener_id);
    let _guard = lock.lock().await;

    if !availability::is_free(&mut conn, purchase.listener_id)? {
        let alternatives = availability::free_listeners(&mut conn, purchase.listener_id)?;
        return Err(PurchaseError::ListenerBusy { alternatives });
    }

    let now = OffsetDateTime::now_utc();
    let session_id = Uuid::new_v4();
    let media_channel = MediaTokenIssuer::channel_name(session_id, now);

    let session = conn.transaction::<db::sessions::Session, PurchaseError, _>(|conn| {
        let session = db::sessions::insert(
            conn,
            session_id,
            purchase.talker_id,
            purchase.listener_id,
            purchase.id,
            purchase.kind,
            purchase.duration_minutes,
            &media_channel,
        )?;

        let linked = db::purchases::link_session(conn, purchase.id, session.id)?;
        if linked == 0 {
            return Err(PurchaseError::AlreadyAllocated);
        }

        Ok(session)
    })?;

    tracing::info!(
        %session_id,
        purchase_id = %purchase.id,
        listener_id = %purchase.listener_id,
        "Allocated call session"
    );

    let talker_name = db::users::get(&mut conn, talker_id)?
        .map(|u| u.name)
        .unwrap_or_default();

    state.fabric.publish(
        &crate::fabric::user_group(purchase.listener_id),
        Event::IncomingCall {
            session_id,
            talker_id,
            talker_name,
            kind: session.kind.into(),
            total_minutes: session.total_minutes_purchased,
            server_time: now,
        },
    );
    for user in [session.talker_id, session.listener_id] {
        state.fabric.publish(
            &crate::fabric::user_group(user),
            Event::ConversationListChanged { server_time: now },
        );
    }

    let media = state.media.issue(
        &session.media_channel,
        MediaTokenIssuer::participant_uid(talker_id),
        MediaRole::Publisher,
        now,
    );
    let media = commons::MediaCredentials {
        kind: session.kind.into(),
        ..media
    };

    Ok(SessionAllocation {
        attach_url: commons::call_attach_path(session.id),
        session: session.to_api(),
        media,
    })
}

#[derive(Debug, Deserialize)]
pub struct RejectParams {
    pub session_id: Uuid,
    pub reason: commons::RejectionReason,
    pub notes: Option<String>,
}

/// Listener turns down an unaccepted call: the talker is refunded, the
/// payout row is cancelled and the session fails. Rejecting twice is a
/// successful no-op.
pub async fn reject_call(
    state: &Arc<AppState>,
    listener_id: Uuid,
    params: RejectParams,
) -> Result<RejectionOutcome, PurchaseError> {
    let mut conn = state.conn()?;

    let session = db::sessions::get(&mut conn, params.session_id)?
        .ok_or(PurchaseError::SessionUnavailable)?;
    if session.listener_id != listener_id {
        return Err(PurchaseError::NotTheListener);
    }

    let purchase = db::purchases::get(&mut conn, session.initial_purchase_id)?
        .ok_or(PurchaseError::PurchaseNotFound)?;

    // Successful-duplicate: the refund already went through.
    if purchase.status == PurchaseStatus::Refunded {
        let existing = db::rejections::by_purchase(&mut conn, purchase.id)?;
        return Ok(RejectionOutcome {
            refund_ref: existing.and_then(|r| r.refund_ref),
            refund_amount: purchase.total,
            duplicate: true,
        });
    }

    if session.status != SessionStatus::Connecting {
        return Err(PurchaseError::WrongState(format!("{:?}", session.status)));
    }

    // Upstream first: if the processor refuses, local state is untouched.
    let refund_ref = match &purchase.external_payment_ref {
        Some(payment_ref) => Some(
            state
                .gateway
                .refund(payment_ref, "Listener rejected the call")
                .await
                .map_err(PurchaseError::Upstream)?
                .refund_ref,
        ),
        None => None,
    };

    let rejection = conn.transaction::<db::rejections::RejectionRecord, PurchaseError, _>(|conn| {
        let rejection = db::rejections::insert(
            conn,
            purchase.id,
            session.id,
            listener_id,
            session.talker_id,
            params.reason.into(),
            params.notes.as_deref(),
        )?;

        db::purchases::mark_refunded(conn, purchase.id, "Listener rejected the call")?;
        db::payouts::cancel_for_purchase(conn, purchase.id)?;

        if let Some(refund_ref) = &refund_ref {
            db::rejections::mark_refunded(conn, rejection.id, purchase.total, refund_ref)?;
        }

        Ok(rejection)
    })?;

    tracing::info!(
        session_id = %session.id,
        purchase_id = %purchase.id,
        rejection_id = %rejection.id,
        "Call rejected, refund issued"
    );

    state
        .engine
        .fail_connecting(session.id, EndReason::Rejected)
        .await
        .map_err(|e| PurchaseError::Storage(anyhow::anyhow!(e)))?;

    Ok(RejectionOutcome {
        refund_ref,
        refund_amount: purchase.total,
        duplicate: false,
    })
}
