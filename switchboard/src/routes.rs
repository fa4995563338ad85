use crate::auth;
use crate::availability;
use crate::availability::ListenerLocks;
use crate::collection;
use crate::collection::CollectionError;
use crate::db;
use crate::db::custom_types::CallKind;
use crate::db::PgPool;
use crate::fabric::Fabric;
use crate::media::MediaRole;
use crate::media::MediaTokenIssuer;
use crate::payments::webhook::post_payment_webhook;
use crate::payments::PaymentGateway;
use crate::purchase;
use crate::purchase::PurchaseError;
use crate::session;
use crate::session::CallError;
use crate::session::Engine;
use crate::settings::Settings;
use crate::ws::call_attachment_handler;
use crate::ws::conversations_handler;
use crate::ws::notifications_handler;
use crate::AppError;
use anyhow::Context;
use axum::extract::Path;
use axum::extract::State;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::PooledConnection;
use diesel::PgConnection;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

pub struct AppState {
    pub pool: PgPool,
    pub settings: RwLock<Settings>,
    pub fabric: Arc<Fabric>,
    pub engine: Arc<Engine>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub media: MediaTokenIssuer,
    pub listener_locks: ListenerLocks,
}

impl AppState {
    pub fn conn(
        &self,
    ) -> anyhow::Result<PooledConnection<ConnectionManager<PgConnection>>> {
        self.pool.get().context("Could not acquire db connection")
    }
}

pub fn router(pool: PgPool, settings: Settings, gateway: Arc<dyn PaymentGateway>) -> Router {
    let fabric = Arc::new(Fabric::new());
    let engine = Engine::new(
        pool.clone(),
        fabric.clone(),
        settings.timer_tick_interval(),
        settings.warning_threshold_minutes,
    );
    let media = MediaTokenIssuer::new(
        settings.media_app_id.clone(),
        settings.media_app_certificate.clone(),
        settings.media_token_ttl_sec,
    );

    let app_state = Arc::new(AppState {
        pool,
        settings: RwLock::new(settings),
        fabric,
        engine,
        gateway,
        media,
        listener_locks: ListenerLocks::new(),
    });

    Router::new()
        .route("/", get(index))
        .route("/api/packages", get(get_packages))
        .route("/api/admin/users", post(post_register_user))
        .route("/api/admin/packages", post(post_package))
        .route("/api/admin/packages/:package_id", post(set_package_active))
        .route("/api/calls/purchase", post(post_purchase))
        .route("/api/calls/extend", post(post_extend))
        .route("/api/calls/allocate", post(post_allocate))
        .route("/api/calls/accept", post(post_accept))
        .route("/api/calls/end", post(post_end))
        .route("/api/calls/reject", post(post_reject))
        .route("/api/calls/:session_id", get(get_session))
        .route(
            "/api/listeners/:listener_id/availability",
            get(get_availability),
        )
        .route("/api/balance", get(get_balance))
        .route("/api/payouts", get(get_payouts))
        .route("/api/payouts/collect", post(post_collect_payouts))
        .route("/api/payments/webhook", post(post_payment_webhook))
        .route(
            "/api/admin/settings",
            get(get_settings).put(update_settings),
        )
        .route("/ws/call/:session_id", get(call_attachment_handler))
        .route("/ws/notifications", get(notifications_handler))
        .route("/ws/conversations", get(conversations_handler))
        .with_state(app_state)
}

#[derive(Serialize)]
struct ServiceInfo {
    service: String,
    version: String,
}

async fn index() -> impl IntoResponse {
    Json(ServiceInfo {
        service: "switchboard".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Resolve the caller from the `Authorization: Bearer` header.
async fn authenticate(state: &Arc<AppState>, headers: &HeaderMap) -> Result<Uuid, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

    let secret = state.settings.read().await.auth_token_secret.clone();
    auth::verify_token(&secret, token, OffsetDateTime::now_utc())
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {e}")))
}

impl From<PurchaseError> for AppError {
    fn from(value: PurchaseError) -> Self {
        match value {
            PurchaseError::TemplateUnavailable
            | PurchaseError::ListenerNotFound
            | PurchaseError::PurchaseNotFound
            | PurchaseError::SessionUnavailable => AppError::NotFound(value.to_string()),
            PurchaseError::NotTheTalker | PurchaseError::NotTheListener => {
                AppError::Forbidden(value.to_string())
            }
            PurchaseError::NotAnInitialPurchase => AppError::BadRequest(value.to_string()),
            PurchaseError::ListenerBusy { .. }
            | PurchaseError::NotConfirmed
            | PurchaseError::AlreadyAllocated
            | PurchaseError::WrongState(_) => AppError::Conflict(value.to_string()),
            PurchaseError::Upstream(e) => AppError::Upstream(format!("{e:#}")),
            PurchaseError::Database(e) => AppError::InternalServerError(format!("{e:#}")),
            PurchaseError::Storage(e) => AppError::InternalServerError(format!("{e:#}")),
        }
    }
}

impl From<CallError> for AppError {
    fn from(value: CallError) -> Self {
        match value {
            CallError::NotFound => AppError::NotFound(value.to_string()),
            CallError::NotParticipant | CallError::NotListener => {
                AppError::Forbidden(value.to_string())
            }
            CallError::WrongState(_) => AppError::Conflict(value.to_string()),
            CallError::Database(e) => AppError::InternalServerError(format!("{e:#}")),
            CallError::Storage(e) => AppError::InternalServerError(format!("{e:#}")),
        }
    }
}

/// Busy rejections carry the list of free alternatives in the body.
fn purchase_error_response(error: PurchaseError) -> Response {
    match error {
        PurchaseError::ListenerBusy { alternatives } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "Listener is not available right now",
                "free_listeners": alternatives,
            })),
        )
            .into_response(),
        other => AppError::from(other).into_response(),
    }
}

#[instrument(skip_all, err(Debug))]
async fn post_purchase(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<purchase::CreatePurchaseParams>,
) -> Result<Response, AppError> {
    let talker_id = authenticate(&state, &headers).await?;

    match purchase::create_initial_purchase(&state, talker_id, params.0).await {
        Ok(receipt) => Ok((StatusCode::CREATED, Json(receipt)).into_response()),
        Err(e) => Ok(purchase_error_response(e)),
    }
}

#[instrument(skip_all, err(Debug))]
async fn post_extend(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<purchase::CreateExtensionParams>,
) -> Result<(StatusCode, Json<commons::CheckoutReceipt>), AppError> {
    let talker_id = authenticate(&state, &headers).await?;

    let receipt = purchase::create_extension_purchase(&state, talker_id, params.0).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[instrument(skip_all, err(Debug))]
async fn post_allocate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<purchase::AllocateParams>,
) -> Result<Response, AppError> {
    let talker_id = authenticate(&state, &headers).await?;

    match purchase::allocate_session(&state, talker_id, params.0).await {
        Ok(allocation) => Ok((StatusCode::CREATED, Json(allocation)).into_response()),
        Err(e) => Ok(purchase_error_response(e)),
    }
}

#[derive(Debug, Deserialize)]
struct SessionActionParams {
    session_id: Uuid,
}

#[derive(Serialize)]
struct AcceptResponse {
    session: commons::SessionInfo,
    media: commons::MediaCredentials,
    #[serde(with = "rust_decimal::serde::float")]
    remaining_minutes: Decimal,
    timer_started: bool,
}

#[instrument(skip_all, err(Debug))]
async fn post_accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<SessionActionParams>,
) -> Result<Json<AcceptResponse>, AppError> {
    let listener_id = authenticate(&state, &headers).await?;

    let session = state.engine.accept(params.session_id, listener_id).await?;

    let now = OffsetDateTime::now_utc();
    let media = state.media.issue(
        &session.media_channel,
        MediaTokenIssuer::participant_uid(listener_id),
        MediaRole::Publisher,
        now,
    );
    let media = commons::MediaCredentials {
        kind: session.kind.into(),
        ..media
    };

    Ok(Json(AcceptResponse {
        remaining_minutes: session::remaining_minutes(&session, now),
        session: session.to_api(),
        media,
        timer_started: true,
    }))
}

#[instrument(skip_all, err(Debug))]
async fn post_end(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<SessionActionParams>,
) -> Result<Json<commons::SessionInfo>, AppError> {
    let caller = authenticate(&state, &headers).await?;

    let session = state
        .engine
        .end_call(params.session_id, Some(caller), commons::EndReason::Hangup)
        .await?;

    Ok(Json(session.to_api()))
}

#[derive(Serialize)]
struct RejectResponse {
    rejected: bool,
    duplicate: bool,
    refund_ref: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    refund_amount: Decimal,
}

#[instrument(skip_all, err(Debug))]
async fn post_reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Json<purchase::RejectParams>,
) -> Result<Json<RejectResponse>, AppError> {
    let listener_id = authenticate(&state, &headers).await?;

    let outcome = purchase::reject_call(&state, listener_id, params.0).await?;

    Ok(Json(RejectResponse {
        rejected: true,
        duplicate: outcome.duplicate,
        refund_ref: outcome.refund_ref,
        refund_amount: outcome.refund_amount,
    }))
}

#[instrument(skip_all, err(Debug))]
async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<Json<commons::SessionInfo>, AppError> {
    let caller = authenticate(&state, &headers).await?;

    let mut conn = state.conn().map_err(internal)?;
    let session = db::sessions::get(&mut conn, session_id)
        .map_err(internal)?
        .ok_or_else(|| AppError::NotFound("Call session not found".to_string()))?;

    if !session.is_participant(caller) {
        return Err(AppError::Forbidden(
            "You are not a participant in this call".to_string(),
        ));
    }

    Ok(Json(session.to_api()))
}

#[derive(Serialize)]
struct AvailabilityResponse {
    listener_id: Uuid,
    available: bool,
}

async fn get_availability(
    State(state): State<Arc<AppState>>,
    Path(listener_id): Path<Uuid>,
) -> Result<Json<AvailabilityResponse>, AppError> {
    let mut conn = state.conn().map_err(internal)?;
    let available = availability::is_free(&mut conn, listener_id).map_err(internal)?;

    Ok(Json(AvailabilityResponse {
        listener_id,
        available,
    }))
}

#[instrument(skip_all, err(Debug))]
async fn get_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<commons::BalanceInfo>, AppError> {
    let listener_id = authenticate(&state, &headers).await?;

    let mut conn = state.conn().map_err(internal)?;
    let balance = db::balances::get(&mut conn, listener_id).map_err(internal)?;
    let withdrawable = db::payouts::withdrawable_sum(&mut conn, listener_id).map_err(internal)?;
    let extension_earned = db::payouts::extension_sum(&mut conn, listener_id).map_err(internal)?;

    Ok(Json(commons::BalanceInfo {
        available: balance.as_ref().map(|b| b.available).unwrap_or(Decimal::ZERO),
        lifetime_earned: balance
            .as_ref()
            .map(|b| b.lifetime_earned)
            .unwrap_or(Decimal::ZERO),
        withdrawable,
        extension_earned,
    }))
}

#[instrument(skip_all, err(Debug))]
async fn get_payouts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<commons::PayoutInfo>>, AppError> {
    let listener_id = authenticate(&state, &headers).await?;

    let mut conn = state.conn().map_err(internal)?;
    let payouts = db::payouts::for_listener(&mut conn, listener_id).map_err(internal)?;

    Ok(Json(payouts.iter().map(|p| p.to_api()).collect()))
}

#[derive(Serialize)]
struct CollectionResponse {
    transfer_ref: String,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    payouts: usize,
}

/// Move the listener's earned (non-extension) payouts into collection and
/// push the money out through the gateway. The webhook's
/// `kind=payout_collection` confirmation flips them to completed.
#[instrument(skip_all, err(Debug))]
async fn post_collect_payouts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CollectionResponse>, AppError> {
    let listener_id = authenticate(&state, &headers).await?;

    let receipt = collection::collect_for_listener(&state.pool, &state.gateway, listener_id)
        .await
        .map_err(|e| match e {
            CollectionError::NothingToCollect => AppError::BadRequest(e.to_string()),
            CollectionError::BalanceMismatch => AppError::Conflict(e.to_string()),
            CollectionError::Transfer(_) => AppError::Upstream(e.to_string()),
            CollectionError::Database(e) => internal(e),
            CollectionError::Storage(e) => internal(e),
        })?;

    Ok(Json(CollectionResponse {
        transfer_ref: receipt.transfer_ref,
        amount: receipt.amount,
        payouts: receipt.payouts,
    }))
}

async fn get_packages(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<commons::PackageInfo>>, AppError> {
    let mut conn = state.conn().map_err(internal)?;
    let templates = db::package_templates::all(&mut conn).map_err(internal)?;

    Ok(Json(
        templates
            .iter()
            .filter(|t| t.active)
            .map(|t| t.to_api())
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RegisterRole {
    Talker,
    Listener,
}

#[derive(Debug, Deserialize)]
struct RegisterUserParams {
    id: Uuid,
    name: String,
    role: RegisterRole,
}

/// Accounts live in the external identity system; this mirrors them into
/// the store so sessions and ledgers can reference them.
#[instrument(skip_all, err(Debug))]
async fn post_register_user(
    State(state): State<Arc<AppState>>,
    params: Json<RegisterUserParams>,
) -> Result<StatusCode, AppError> {
    let params = params.0;
    if params.name.trim().is_empty() {
        return Err(AppError::BadRequest("name must not be empty".to_string()));
    }

    let role = match params.role {
        RegisterRole::Talker => db::custom_types::UserRole::Talker,
        RegisterRole::Listener => db::custom_types::UserRole::Listener,
    };

    let mut conn = state.conn().map_err(internal)?;
    db::users::insert(&mut conn, params.id, &params.name, role).map_err(internal)?;

    tracing::info!(user_id = %params.id, "Registered new user");

    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct NewPackageParams {
    name: String,
    kind: commons::CallKind,
    duration_minutes: i32,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    fee_percent: Decimal,
}

#[instrument(skip_all, err(Debug))]
async fn post_package(
    State(state): State<Arc<AppState>>,
    params: Json<NewPackageParams>,
) -> Result<(StatusCode, Json<commons::PackageInfo>), AppError> {
    let params = params.0;
    if params.duration_minutes < 1 {
        return Err(AppError::BadRequest(
            "duration_minutes must be at least 1".to_string(),
        ));
    }
    if params.price <= Decimal::ZERO {
        return Err(AppError::BadRequest("price must be positive".to_string()));
    }
    if params.fee_percent < Decimal::ZERO || params.fee_percent > Decimal::ONE_HUNDRED {
        return Err(AppError::BadRequest(
            "fee_percent must be between 0 and 100".to_string(),
        ));
    }

    let mut conn = state.conn().map_err(internal)?;
    let template = db::package_templates::insert(
        &mut conn,
        &params.name,
        CallKind::from(params.kind),
        params.duration_minutes,
        params.price.round_dp(2),
        params.fee_percent.round_dp(2),
    )
    .map_err(internal)?;

    tracing::info!(template_id = %template.id, name = %template.name, "Created package template");

    Ok((StatusCode::CREATED, Json(template.to_api())))
}

#[derive(Debug, Deserialize)]
struct PackageActiveParams {
    active: bool,
}

#[instrument(skip_all, err(Debug))]
async fn set_package_active(
    State(state): State<Arc<AppState>>,
    Path(package_id): Path<Uuid>,
    params: Json<PackageActiveParams>,
) -> Result<Json<commons::PackageInfo>, AppError> {
    let mut conn = state.conn().map_err(internal)?;

    let updated =
        db::package_templates::set_active(&mut conn, package_id, params.active).map_err(internal)?;
    if updated == 0 {
        return Err(AppError::NotFound("Package not found".to_string()));
    }

    let template = db::package_templates::get(&mut conn, package_id)
        .map_err(internal)?
        .ok_or_else(|| AppError::NotFound("Package not found".to_string()))?;

    Ok(Json(template.to_api()))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = state.settings.read().await;
    serde_json::to_string(&*settings).expect("to be able to serialise settings")
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(mut updated_settings): Json<Settings>,
) -> Result<(), AppError> {
    let mut settings = state.settings.write().await;
    updated_settings.keep_path_from(&settings);
    *settings = updated_settings;

    settings
        .write_to_file()
        .await
        .map_err(|e| AppError::InternalServerError(format!("Could not write settings: {e:#}")))?;

    Ok(())
}

fn internal<E>(e: E) -> AppError
where
    E: Into<anyhow::Error>,
{
    let e: anyhow::Error = e.into();
    AppError::InternalServerError(format!("{e:#}"))
}
