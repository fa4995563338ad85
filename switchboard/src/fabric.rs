use commons::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per group. Slow attachments that fall further behind
/// than this observe a lagged receiver and resynchronize via `get_status`.
const GROUP_BUFFER_SIZE: usize = 100;

/// Name of the per-session fan-out group.
pub fn session_group(session_id: Uuid) -> String {
    format!("call_{session_id}")
}

/// Name of the per-user notification group.
pub fn user_group(user_id: Uuid) -> String {
    format!("user_{user_id}")
}

/// Named broadcast groups shared by all sessions. Events published to a
/// group reach every current subscriber in publish order; groups without
/// subscribers are dropped on the next publish.
#[derive(Default)]
pub struct Fabric {
    groups: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Event> {
        let mut groups = self.groups.lock();
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_BUFFER_SIZE).0)
            .subscribe()
    }

    /// Fan an event out to a group. Returns the number of attachments that
    /// received it; publishing to an empty or unknown group is not an error.
    pub fn publish(&self, group: &str, event: Event) -> usize {
        let mut groups = self.groups.lock();
        let Some(sender) = groups.get(group) else {
            return 0;
        };

        match sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                // Last subscriber is gone; drop the group.
                groups.remove(group);
                0
            }
        }
    }

    #[cfg(test)]
    fn group_count(&self) -> usize {
        self.groups.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let fabric = Fabric::new();
        let group = session_group(Uuid::new_v4());
        let mut rx = fabric.subscribe(&group);

        fabric.publish(&group, Event::Pong);
        fabric.publish(
            &group,
            Event::Error {
                code: 500,
                message: "first error".to_string(),
                server_time: time::OffsetDateTime::now_utc(),
            },
        );

        assert_eq!(rx.recv().await.unwrap(), Event::Pong);
        assert!(matches!(rx.recv().await.unwrap(), Event::Error { .. }));
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let fabric = Fabric::new();
        let group_a = session_group(Uuid::new_v4());
        let group_b = session_group(Uuid::new_v4());
        let mut rx_a = fabric.subscribe(&group_a);
        let _rx_b = fabric.subscribe(&group_b);

        assert_eq!(fabric.publish(&group_b, Event::Pong), 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_groups_are_garbage_collected() {
        let fabric = Fabric::new();
        let group = user_group(Uuid::new_v4());

        let rx = fabric.subscribe(&group);
        assert_eq!(fabric.group_count(), 1);
        drop(rx);

        // The next publish notices the dead group and removes it.
        assert_eq!(fabric.publish(&group, Event::Pong), 0);
        assert_eq!(fabric.group_count(), 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_group_is_a_noop() {
        let fabric = Fabric::new();
        assert_eq!(fabric.publish("call_unknown", Event::Pong), 0);
    }
}
