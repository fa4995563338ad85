use crate::db::custom_types::PurchaseStatus;
use crate::db::custom_types::SessionStatus;
use crate::db::custom_types::UserRole;
use crate::schema::call_sessions;
use crate::schema::purchases;
use crate::schema::users;
use commons::ListenerHint;
use diesel::dsl::exists;
use diesel::dsl::not;
use diesel::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// How many alternative listeners a busy-rejection suggests.
const FREE_LISTENER_HINTS: i64 = 10;

/// True iff the listener has no session in {connecting, active} and no
/// purchase in {in_progress}. One round trip, both checks indexed on
/// `(listener_id, status)`.
pub fn is_free(conn: &mut PgConnection, listener_id: Uuid) -> QueryResult<bool> {
    let busy_session = call_sessions::table
        .filter(call_sessions::listener_id.eq(listener_id))
        .filter(call_sessions::status.eq_any([SessionStatus::Connecting, SessionStatus::Active]));

    let busy_purchase = purchases::table
        .filter(purchases::listener_id.eq(listener_id))
        .filter(purchases::status.eq(PurchaseStatus::InProgress));

    let (in_session, in_purchase): (bool, bool) =
        diesel::select((exists(busy_session), exists(busy_purchase))).get_result(conn)?;

    Ok(!in_session && !in_purchase)
}

/// Up to ten currently-free listeners, excluding the one just found busy.
/// A courtesy for the rejected talker, not a reservation.
pub fn free_listeners(conn: &mut PgConnection, exclude: Uuid) -> QueryResult<Vec<ListenerHint>> {
    let rows: Vec<(Uuid, String)> = users::table
        .filter(users::role.eq(UserRole::Listener))
        .filter(users::id.ne(exclude))
        .filter(not(exists(
            call_sessions::table
                .filter(call_sessions::listener_id.eq(users::id))
                .filter(
                    call_sessions::status
                        .eq_any([SessionStatus::Connecting, SessionStatus::Active]),
                ),
        )))
        .filter(not(exists(
            purchases::table
                .filter(purchases::listener_id.eq(users::id))
                .filter(purchases::status.eq(PurchaseStatus::InProgress)),
        )))
        .order(users::name.asc())
        .limit(FREE_LISTENER_HINTS)
        .select((users::id, users::name))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(id, name)| ListenerHint { id, name })
        .collect())
}

/// Per-listener serialization for the availability check plus whatever
/// creation follows it. Two concurrent purchase attempts for the same
/// listener queue behind the same entry, so both cannot pass `is_free`.
#[derive(Default)]
pub struct ListenerLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ListenerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, listener_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(listener_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_listener_serializes() {
        let locks = ListenerLocks::new();
        let listener = Uuid::new_v4();

        let lock = locks.acquire(listener);
        let guard = lock.lock().await;

        // A second purchase attempt for the same listener has to wait.
        let contender = locks.acquire(listener);
        assert!(contender.try_lock().is_err());

        drop(guard);
        assert!(contender.try_lock().is_ok());
    }

    #[tokio::test]
    async fn different_listeners_do_not_block_each_other() {
        let locks = ListenerLocks::new();

        let lock_a = locks.acquire(Uuid::new_v4());
        let _guard_a = lock_a.lock().await;

        let lock_b = locks.acquire(Uuid::new_v4());
        assert!(lock_b.try_lock().is_ok());
    }
}
