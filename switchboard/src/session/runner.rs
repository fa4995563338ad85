use crate::db;
use crate::fabric::session_group;
use crate::session::envelope;
use crate::session::tick_action;
use crate::session::CallError;
use crate::session::Engine;
use crate::session::TickAction;
use anyhow::Result;
use commons::Event;
use std::ops::ControlFlow;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// The per-session timer loop. Wakes on a fixed cadence, reloads the
/// session from the store (which is how extensions take effect without
/// coordination) and acts on what it finds. The loop outlives any single
/// attachment; only a terminal status stops it.
pub(crate) async fn run(engine: Arc<Engine>, session_id: Uuid) {
    tracing::debug!(%session_id, "Session runner started");

    loop {
        tokio::time::sleep(engine.tick_interval).await;

        match tick(&engine, session_id).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break,
            Err(e) => {
                // Store hiccups don't kill the timer; the next tick retries.
                tracing::error!(%session_id, "Timer tick failed: {e:#}");
            }
        }
    }

    engine.remove_runner(session_id);
    tracing::debug!(%session_id, "Session runner stopped");
}

async fn tick(engine: &Arc<Engine>, session_id: Uuid) -> Result<ControlFlow<()>> {
    let mut conn = engine.conn().await?;

    let Some(session) = db::sessions::get(&mut conn, session_id)? else {
        tracing::warn!(%session_id, "Session disappeared, stopping runner");
        return Ok(ControlFlow::Break(()));
    };

    let now = OffsetDateTime::now_utc();
    match tick_action(&session, now, engine.warning_threshold_minutes) {
        TickAction::Exit => Ok(ControlFlow::Break(())),
        TickAction::Idle => Ok(ControlFlow::Continue(())),
        TickAction::Expire => {
            drop(conn);
            match engine.expire(session_id).await {
                Ok(()) => {}
                // Someone ended the call in the same instant; their
                // transition wins and the runner just exits.
                Err(CallError::WrongState(_)) => {}
                Err(e) => return Err(e.into()),
            }
            Ok(ControlFlow::Break(()))
        }
        TickAction::Warn => {
            // The persistent flag makes the warning at-most-once even if
            // two runners ever raced here.
            let updated = db::sessions::mark_warning_sent(&mut conn, session_id)?;
            if updated > 0 {
                tracing::debug!(%session_id, "Sending low-time warning");
                engine.fabric().publish(
                    &session_group(session_id),
                    Event::TimeWarning {
                        envelope: envelope(&session, now),
                    },
                );
            }
            Ok(ControlFlow::Continue(()))
        }
        TickAction::Update => {
            engine.fabric().publish(
                &session_group(session_id),
                Event::TimeUpdate {
                    envelope: envelope(&session, now),
                },
            );
            Ok(ControlFlow::Continue(()))
        }
    }
}
