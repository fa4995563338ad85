use crate::db;
use crate::db::custom_types::PayoutStatus;
use crate::db::custom_types::SessionStatus;
use crate::db::purchases::Purchase;
use crate::db::sessions::Session;
use crate::fabric::session_group;
use crate::fabric::Fabric;
use anyhow::Context;
use commons::EndReason;
use commons::Event;
use commons::SessionEnvelope;
use diesel::r2d2::ConnectionManager;
use diesel::r2d2::PooledConnection;
use diesel::Connection;
use diesel::PgConnection;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use uuid::Uuid;

mod runner;

type PooledPg = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Call session not found")]
    NotFound,
    #[error("You are not a participant in this call")]
    NotParticipant,
    #[error("Only the listener can accept the call")]
    NotListener,
    #[error("Call is in the wrong state: {0}")]
    WrongState(String),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// What happened to an extension confirmation.
#[derive(Debug)]
pub enum ExtendOutcome {
    Applied { session: Session, added_minutes: i32 },
    /// The webhook was a replay; nothing changed.
    Duplicate,
    /// The session was already terminal; the purchase needs a refund.
    RefundRequired { purchase: Purchase },
}

/// Per-call state machine owner. One runner task per live session drives
/// the authoritative countdown; the public operations mutate the store
/// under short per-session transactions and fan events out through the
/// fabric. This is the only component that writes listener balances.
pub struct Engine {
    pool: db::PgPool,
    fabric: Arc<Fabric>,
    tick_interval: Duration,
    warning_threshold_minutes: u32,
    runners: Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        pool: db::PgPool,
        fabric: Arc<Fabric>,
        tick_interval: Duration,
        warning_threshold_minutes: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            fabric,
            tick_interval,
            warning_threshold_minutes,
            runners: Mutex::new(HashMap::new()),
        })
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Spawn the session's runner if it is not already running. The
    /// registry entry is the per-session startup lock: two racing
    /// attachments cannot both spawn one.
    pub fn ensure_runner(self: &Arc<Self>, session_id: Uuid) {
        let mut runners = self.runners.lock();
        if runners.contains_key(&session_id) {
            return;
        }

        let engine = self.clone();
        let handle = tokio::spawn(runner::run(engine, session_id));
        runners.insert(session_id, handle);

        tracing::debug!(%session_id, "Spawned session runner");
    }

    fn remove_runner(&self, session_id: Uuid) {
        self.runners.lock().remove(&session_id);
    }

    async fn conn(&self) -> anyhow::Result<PooledPg> {
        let pool = self.pool.clone();
        spawn_blocking(move || pool.get())
            .await
            .expect("task to complete")
            .context("Could not acquire db connection")
    }

    /// Listener accepts: `connecting -> active`, countdown starts now.
    pub async fn accept(self: &Arc<Self>, session_id: Uuid, caller: Uuid) -> Result<Session, CallError> {
        let mut conn = self.conn().await?;

        let session = db::sessions::get(&mut conn, session_id)?.ok_or(CallError::NotFound)?;
        if session.listener_id != caller {
            return Err(CallError::NotListener);
        }
        if session.status != SessionStatus::Connecting {
            return Err(CallError::WrongState(format!("{:?}", session.status)));
        }

        let now = OffsetDateTime::now_utc();
        let initial_purchase_id = session.initial_purchase_id;

        let session = conn.transaction::<Session, CallError, _>(|conn| {
            let updated = db::sessions::accept(conn, session_id, now)?;
            if updated == 0 {
                // Lost the race against another transition.
                return Err(CallError::WrongState("not connecting".to_string()));
            }

            db::purchases::mark_in_progress(conn, initial_purchase_id)?;

            db::sessions::get(conn, session_id)?.ok_or(CallError::NotFound)
        })?;

        tracing::info!(%session_id, listener_id = %caller, "Call accepted, timer started");

        let started_at = session.started_at.unwrap_or(now);
        self.fabric.publish(
            &session_group(session_id),
            Event::CallAccepted {
                envelope: envelope(&session, now),
                total_minutes: session.total_minutes_purchased,
                started_at,
            },
        );

        // The timer usually starts with the first attachment; acceptance
        // is the latest point where it must exist.
        self.ensure_runner(session_id);

        Ok(session)
    }

    /// Either party hangs up: `-> ended`, money committed, group notified.
    pub async fn end_call(
        &self,
        session_id: Uuid,
        caller: Option<Uuid>,
        reason: EndReason,
    ) -> Result<Session, CallError> {
        let mut conn = self.conn().await?;

        let session = db::sessions::get(&mut conn, session_id)?.ok_or(CallError::NotFound)?;
        if let Some(caller) = caller {
            if !session.is_participant(caller) {
                return Err(CallError::NotParticipant);
            }
        }
        if session.status.is_terminal() {
            return Err(CallError::WrongState(format!("{:?}", session.status)));
        }

        let now = OffsetDateTime::now_utc();
        let session = conn.transaction::<Session, CallError, _>(|conn| {
            terminate_tx(conn, &session, SessionStatus::Ended, &reason.to_string(), now)
        })?;

        let minutes_used = session.minutes_used.unwrap_or(Decimal::ZERO);
        tracing::info!(
            %session_id,
            %minutes_used,
            ended_by = ?caller,
            "Call ended"
        );

        self.fabric.publish(
            &session_group(session_id),
            Event::CallEnded {
                envelope: envelope(&session, now),
                reason,
                minutes_used,
                ended_by: caller,
            },
        );

        Ok(session)
    }

    /// Timer observed `remaining <= 0`: `active -> timeout`.
    pub(crate) async fn expire(&self, session_id: Uuid) -> Result<(), CallError> {
        let mut conn = self.conn().await?;

        let session = db::sessions::get(&mut conn, session_id)?.ok_or(CallError::NotFound)?;
        if session.status.is_terminal() {
            return Ok(());
        }

        let now = OffsetDateTime::now_utc();
        let session = conn.transaction::<Session, CallError, _>(|conn| {
            terminate_tx(
                conn,
                &session,
                SessionStatus::Timeout,
                &EndReason::Timeout.to_string(),
                now,
            )
        })?;

        let minutes_used = session.minutes_used.unwrap_or(Decimal::ZERO);
        tracing::info!(%session_id, %minutes_used, "Call timed out");

        let group = session_group(session_id);
        self.fabric.publish(
            &group,
            Event::CallEnding {
                envelope: envelope(&session, now),
                reason: EndReason::Timeout,
            },
        );
        self.fabric.publish(
            &group,
            Event::CallEnded {
                envelope: envelope(&session, now),
                reason: EndReason::Timeout,
                minutes_used,
                ended_by: None,
            },
        );

        Ok(())
    }

    /// `connecting -> failed` when the initial purchase is cancelled or
    /// refunded before acceptance.
    pub async fn fail_connecting(&self, session_id: Uuid, reason: EndReason) -> Result<(), CallError> {
        let mut conn = self.conn().await?;

        let failed = db::sessions::fail(&mut conn, session_id, &reason.to_string())?;
        if failed == 0 {
            return Ok(());
        }

        let session = db::sessions::get(&mut conn, session_id)?.ok_or(CallError::NotFound)?;
        tracing::info!(%session_id, %reason, "Connecting call failed");

        let now = OffsetDateTime::now_utc();
        self.fabric.publish(
            &session_group(session_id),
            Event::CallEnded {
                envelope: envelope(&session, now),
                reason,
                minutes_used: Decimal::ZERO,
                ended_by: None,
            },
        );

        Ok(())
    }

    /// Apply a paid extension. Idempotent on the purchase id: replays of
    /// the same webhook return [`ExtendOutcome::Duplicate`] and change
    /// nothing.
    pub async fn extend_apply(
        &self,
        session_id: Uuid,
        purchase_id: Uuid,
        external_ref: &str,
    ) -> Result<ExtendOutcome, CallError> {
        let mut conn = self.conn().await?;

        let outcome = conn.transaction::<ExtendOutcome, CallError, _>(|conn| {
            let applied = db::purchases::confirm_extension_used(conn, purchase_id, external_ref)?;
            if applied == 0 {
                return Ok(ExtendOutcome::Duplicate);
            }

            let purchase =
                db::purchases::get(conn, purchase_id)?.ok_or(CallError::NotFound)?;
            let session = db::sessions::get(conn, session_id)?.ok_or(CallError::NotFound)?;

            if session.status.is_terminal() {
                // Paid too late; the money goes back and the ledger keeps
                // a cancelled row for the audit trail.
                db::purchases::mark_refunded(conn, purchase_id, "Call ended before extension")?;
                db::payouts::insert(
                    conn,
                    purchase.listener_id,
                    purchase.id,
                    purchase.listener_amount,
                    PayoutStatus::Cancelled,
                    true,
                )?;
                return Ok(ExtendOutcome::RefundRequired { purchase });
            }

            db::sessions::add_minutes(conn, session_id, purchase.duration_minutes)?;
            db::payouts::insert(
                conn,
                purchase.listener_id,
                purchase.id,
                purchase.listener_amount,
                PayoutStatus::Processing,
                true,
            )?;

            let session = db::sessions::get(conn, session_id)?.ok_or(CallError::NotFound)?;
            Ok(ExtendOutcome::Applied {
                session,
                added_minutes: purchase.duration_minutes,
            })
        })?;

        if let ExtendOutcome::Applied {
            session,
            added_minutes,
        } = &outcome
        {
            let now = OffsetDateTime::now_utc();
            tracing::info!(
                %session_id,
                %purchase_id,
                added_minutes,
                new_total = session.total_minutes_purchased,
                "Extension applied"
            );

            self.fabric.publish(
                &session_group(session_id),
                Event::MinutesExtended {
                    envelope: envelope(session, now),
                    added_minutes: *added_minutes,
                    new_total_minutes: session.total_minutes_purchased,
                    extension_purchase_id: purchase_id,
                },
            );
        }

        Ok(outcome)
    }
}

/// Terminal transition plus its financial side effects, in one
/// transaction. The session must currently be connecting or active.
fn terminate_tx(
    conn: &mut PgConnection,
    session: &Session,
    status: SessionStatus,
    end_reason: &str,
    now: OffsetDateTime,
) -> Result<Session, CallError> {
    let used = minutes_used(session, now);
    let updated = db::sessions::terminate(conn, session.id, status, used, end_reason, now)?;
    if updated == 0 {
        return Err(CallError::WrongState("already terminal".to_string()));
    }

    finalize_money(conn, session)?;

    db::sessions::get(conn, session.id)?.ok_or(CallError::NotFound)
}

/// Money side of a terminal transition: every purchase that funded the
/// session is completed, its payout row flips `processing -> earned`, and
/// the listener's balance is credited once per flipped row. The row lock
/// on the balance serializes credits per listener; the conditional payout
/// flip means a retry credits nothing twice.
fn finalize_money(conn: &mut PgConnection, session: &Session) -> Result<(), CallError> {
    let purchases = db::purchases::funding_session(conn, session.id)?;

    db::purchases::complete_for_session(conn, session.id)?;
    db::balances::lock(conn, session.listener_id)?;

    for purchase in purchases {
        let flipped = match db::payouts::by_purchase(conn, purchase.id)? {
            Some(_) => db::payouts::mark_earned(conn, purchase.id)?,
            None => {
                // The reconciler should have written this row at payment
                // confirmation; repair so no terminal session is left
                // without its ledger entry.
                tracing::warn!(
                    purchase_id = %purchase.id,
                    "Missing payout record at session end, creating it"
                );
                db::payouts::insert(
                    conn,
                    purchase.listener_id,
                    purchase.id,
                    purchase.listener_amount,
                    PayoutStatus::Earned,
                    purchase.is_extension,
                )?
            }
        };

        if flipped > 0 {
            db::balances::credit(conn, session.listener_id, purchase.listener_amount)?;
        }
    }

    Ok(())
}

/// Payment precondition for attaching to a call: the initial purchase must
/// have been confirmed (or be mid-call).
pub fn payment_valid(conn: &mut PgConnection, session: &Session) -> diesel::QueryResult<bool> {
    use crate::db::custom_types::PurchaseStatus;

    let purchase = db::purchases::get(conn, session.initial_purchase_id)?;
    Ok(matches!(
        purchase.map(|p| p.status),
        Some(PurchaseStatus::Confirmed) | Some(PurchaseStatus::InProgress)
    ))
}

/// Shared event envelope for a session at `now`.
pub fn envelope(session: &Session, now: OffsetDateTime) -> SessionEnvelope {
    SessionEnvelope {
        session_id: session.id,
        status: session.status.into(),
        remaining_minutes: remaining_minutes(session, now),
        server_time: now,
    }
}

/// Status snapshot for attach and `get_status`. Before acceptance the
/// timer is not running and the remaining figure is the full purchased
/// total, display-only.
pub fn status_snapshot(session: &Session, now: OffsetDateTime) -> Event {
    let waiting_for_accept =
        session.status == SessionStatus::Connecting && session.started_at.is_none();

    Event::CallStatus {
        envelope: envelope(session, now),
        total_minutes: session.total_minutes_purchased,
        timer_running: session.status == SessionStatus::Active && session.started_at.is_some(),
        waiting_for_accept,
        started_at: session.started_at,
    }
}

fn elapsed_minutes(started_at: OffsetDateTime, now: OffsetDateTime) -> Decimal {
    let elapsed_secs = (now - started_at).whole_seconds().max(0);
    (Decimal::from(elapsed_secs) / Decimal::from(60)).round_dp(2)
}

/// Fractional minutes left on the clock, clamped at zero. While
/// `started_at` is unset nothing has been consumed and the full purchased
/// total is reported.
pub fn remaining_minutes(session: &Session, now: OffsetDateTime) -> Decimal {
    if session.status.is_terminal() {
        return Decimal::ZERO;
    }

    let total = Decimal::from(session.total_minutes_purchased);
    let Some(started_at) = session.started_at else {
        return total;
    };

    (total - elapsed_minutes(started_at, now)).max(Decimal::ZERO)
}

/// Minutes consumed at termination, capped at the purchased total.
pub fn minutes_used(session: &Session, now: OffsetDateTime) -> Decimal {
    let Some(started_at) = session.started_at else {
        return Decimal::ZERO;
    };

    let end = session.ended_at.unwrap_or(now);
    elapsed_minutes(started_at, end).min(Decimal::from(session.total_minutes_purchased))
}

/// One decision per timer wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickAction {
    /// Session is terminal (or gone); the runner exits.
    Exit,
    /// Not accepted yet: no countdown, no warning, no updates.
    Idle,
    /// Purchased minutes are exhausted.
    Expire,
    /// Low-time warning is due (not yet sent).
    Warn,
    /// Regular countdown update.
    Update,
}

pub(crate) fn tick_action(
    session: &Session,
    now: OffsetDateTime,
    warning_threshold_minutes: u32,
) -> TickAction {
    if session.status.is_terminal() {
        return TickAction::Exit;
    }

    // Acceptance gating: a pending listener must not cost the talker
    // purchased minutes.
    if session.started_at.is_none() || session.status != SessionStatus::Active {
        return TickAction::Idle;
    }

    let remaining = remaining_minutes(session, now);
    if remaining <= Decimal::ZERO {
        return TickAction::Expire;
    }

    if remaining <= Decimal::from(warning_threshold_minutes) && !session.warning_sent {
        return TickAction::Warn;
    }

    TickAction::Update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::custom_types::CallKind;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn dummy_session(status: SessionStatus, started_at: Option<OffsetDateTime>) -> Session {
        let created = datetime!(2026-03-02 10:00:00 UTC);
        Session {
            id: Uuid::new_v4(),
            talker_id: Uuid::new_v4(),
            listener_id: Uuid::new_v4(),
            initial_purchase_id: Uuid::new_v4(),
            status,
            kind: CallKind::Audio,
            total_minutes_purchased: 10,
            minutes_used: None,
            started_at,
            ended_at: None,
            end_reason: None,
            warning_sent: false,
            media_channel: "call_test_1".to_string(),
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn no_countdown_before_acceptance() {
        let session = dummy_session(SessionStatus::Connecting, None);
        // Ten wall-clock minutes after allocation, still the full total.
        let now = session.created_at + time::Duration::minutes(10);

        assert_eq!(remaining_minutes(&session, now), dec!(10));
        assert_eq!(minutes_used(&session, now), dec!(0));
        assert_eq!(tick_action(&session, now, 3), TickAction::Idle);
    }

    #[test]
    fn countdown_runs_from_acceptance() {
        let started = datetime!(2026-03-02 10:05:00 UTC);
        let session = dummy_session(SessionStatus::Active, Some(started));

        let now = started + time::Duration::minutes(7) + time::Duration::seconds(30);
        assert_eq!(remaining_minutes(&session, now), dec!(2.5));
    }

    #[test]
    fn early_hangup_records_fractional_minutes() {
        let started = datetime!(2026-03-02 10:00:00 UTC);
        let session = dummy_session(SessionStatus::Active, Some(started));

        // Hang up at 3 min 30 s.
        let now = started + time::Duration::minutes(3) + time::Duration::seconds(30);
        assert_eq!(minutes_used(&session, now), dec!(3.50));
    }

    #[test]
    fn minutes_used_is_capped_at_the_purchased_total() {
        let started = datetime!(2026-03-02 10:00:00 UTC);
        let session = dummy_session(SessionStatus::Active, Some(started));

        // The tick that notices expiry fires a little late.
        let now = started + time::Duration::minutes(10) + time::Duration::seconds(3);
        assert_eq!(minutes_used(&session, now), dec!(10));
    }

    #[test]
    fn timer_expires_at_zero_remaining() {
        let started = datetime!(2026-03-02 10:00:00 UTC);
        let session = dummy_session(SessionStatus::Active, Some(started));

        let now = started + time::Duration::minutes(10);
        assert_eq!(tick_action(&session, now, 3), TickAction::Expire);
    }

    #[test]
    fn warning_fires_once_inside_the_threshold() {
        let started = datetime!(2026-03-02 10:00:00 UTC);
        let mut session = dummy_session(SessionStatus::Active, Some(started));

        let now = started + time::Duration::minutes(7) + time::Duration::seconds(30);
        assert_eq!(tick_action(&session, now, 3), TickAction::Warn);

        // The persistent flag downgrades later ticks to plain updates.
        session.warning_sent = true;
        assert_eq!(tick_action(&session, now, 3), TickAction::Update);
    }

    #[test]
    fn terminal_session_exits_the_loop() {
        let session = dummy_session(SessionStatus::Timeout, Some(datetime!(2026-03-02 10:00:00 UTC)));
        let now = datetime!(2026-03-02 11:00:00 UTC);
        assert_eq!(tick_action(&session, now, 3), TickAction::Exit);
    }

    #[test]
    fn acceptance_at_the_last_moment_still_gets_the_full_budget() {
        // The session rang for ages; acceptance happens "now". The full
        // total must be on the clock from this instant.
        let now = datetime!(2026-03-02 10:30:00 UTC);
        let session = dummy_session(SessionStatus::Active, Some(now));

        assert_eq!(remaining_minutes(&session, now), dec!(10));
        assert_eq!(tick_action(&session, now, 3), TickAction::Update);
    }

    #[test]
    fn extension_with_half_a_minute_left_keeps_the_call_alive() {
        let started = datetime!(2026-03-02 10:00:00 UTC);
        let mut session = dummy_session(SessionStatus::Active, Some(started));
        session.warning_sent = true;

        let now = started + time::Duration::minutes(9) + time::Duration::seconds(30);
        assert_eq!(remaining_minutes(&session, now), dec!(0.5));
        assert_eq!(tick_action(&session, now, 3), TickAction::Update);

        // A ten-minute top-up lands.
        session.total_minutes_purchased += 10;
        assert_eq!(remaining_minutes(&session, now), dec!(10.5));
    }

    #[test]
    fn snapshot_before_acceptance_is_display_only() {
        let session = dummy_session(SessionStatus::Connecting, None);
        let now = session.created_at + time::Duration::minutes(2);

        match status_snapshot(&session, now) {
            Event::CallStatus {
                envelope,
                timer_running,
                waiting_for_accept,
                ..
            } => {
                assert!(!timer_running);
                assert!(waiting_for_accept);
                assert_eq!(envelope.remaining_minutes, dec!(10));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
