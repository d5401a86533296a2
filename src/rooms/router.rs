//! Per-match broadcast rooms
//!
//! Each room is an independent `tokio::sync::broadcast` channel plus a viewer
//! set. Publishing never blocks on a slow subscriber: a viewer that falls
//! behind the bounded buffer sees a lag error on its receiver and re-fetches
//! match state on reconnect instead of relying on redelivery.
//!
//! The router is an explicit instance constructed at startup and passed by
//! handle. There is no process-global registry.

use crate::models::{channel_id_for, MatchEvent};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

const ROOM_BUFFER: usize = 256;

struct Room {
    tx: broadcast::Sender<MatchEvent>,
    viewers: HashSet<Uuid>,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ROOM_BUFFER);
        Self {
            tx,
            viewers: HashSet::new(),
        }
    }
}

pub struct RoomRouter {
    rooms: RwLock<HashMap<String, Room>>,
    close_grace: Duration,
    close_warning: Duration,
}

impl RoomRouter {
    pub fn new(close_grace_secs: u64, close_warning_secs: u64) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            close_grace: Duration::from_secs(close_grace_secs),
            close_warning: Duration::from_secs(close_warning_secs),
        }
    }

    /// Join a match room. Idempotent: re-subscribing the same viewer only
    /// hands out a fresh receiver. Every subscriber (joiner included) gets a
    /// `ViewerJoined` with the new membership count.
    pub fn subscribe(&self, match_id: Uuid, viewer: Uuid) -> broadcast::Receiver<MatchEvent> {
        let channel = channel_id_for(match_id);
        let (rx, count, newly_joined) = {
            let mut rooms = self.rooms.write();
            let room = rooms.entry(channel.clone()).or_insert_with(Room::new);
            let newly_joined = room.viewers.insert(viewer);
            (room.tx.subscribe(), room.viewers.len(), newly_joined)
        };

        if newly_joined {
            debug!(%match_id, %viewer, count, "viewer joined room");
            self.publish(
                match_id,
                MatchEvent::ViewerJoined {
                    match_id,
                    viewer_id: viewer,
                    count,
                },
            );
        }
        rx
    }

    /// Leave a match room. No-op if the viewer was not subscribed.
    pub fn unsubscribe(&self, match_id: Uuid, viewer: Uuid) {
        let channel = channel_id_for(match_id);
        let count = {
            let mut rooms = self.rooms.write();
            match rooms.get_mut(&channel) {
                Some(room) => {
                    if room.viewers.remove(&viewer) {
                        Some(room.viewers.len())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(count) = count {
            debug!(%match_id, %viewer, count, "viewer left room");
            self.publish(
                match_id,
                MatchEvent::ViewerLeft {
                    match_id,
                    viewer_id: viewer,
                    count,
                },
            );
        }
    }

    /// Fan an event out to the match's room. FIFO per room relative to the
    /// publisher; non-blocking; returns how many receivers got it.
    pub fn publish(&self, match_id: Uuid, event: MatchEvent) -> usize {
        let channel = channel_id_for(match_id);
        let rooms = self.rooms.read();
        match rooms.get(&channel) {
            Some(room) => room.tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn viewer_count(&self, match_id: Uuid) -> usize {
        let channel = channel_id_for(match_id);
        self.rooms
            .read()
            .get(&channel)
            .map(|r| r.viewers.len())
            .unwrap_or(0)
    }

    /// Drop the room. Receivers observe a closed channel and disconnect.
    pub fn close_room(&self, match_id: Uuid) {
        let channel = channel_id_for(match_id);
        if self.rooms.write().remove(&channel).is_some() {
            info!(%match_id, "🔒 Room closed");
        }
    }

    /// Grace-window teardown after match completion: wait, warn the room,
    /// wait again, then force-close. Housekeeping only; viewers of a finished
    /// match lose nothing but the warning.
    pub fn schedule_teardown(self: Arc<Self>, match_id: Uuid) {
        let router = self;
        let grace = router.close_grace;
        let warning = router.close_warning;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            router.publish(
                match_id,
                MatchEvent::RoomClosing {
                    match_id,
                    close_in_secs: warning.as_secs(),
                },
            );
            tokio::time::sleep(warning).await;
            router.close_room(match_id);
        });
    }
}

/// Forward the engine's domain events into rooms. The router is merely a
/// subscriber of the match engine's event channel.
pub async fn run_event_dispatcher(
    mut events: broadcast::Receiver<MatchEvent>,
    router: Arc<RoomRouter>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let match_id = event.match_id();
                let ended = matches!(event, MatchEvent::MatchEnded { .. });
                router.publish(match_id, event);
                if ended {
                    Arc::clone(&router).schedule_teardown(match_id);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // Viewers re-fetch state on reconnect; dropped fan-out is
                // not a correctness problem.
                tracing::warn!(missed, "event dispatcher lagged behind the engine");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score_event(match_id: Uuid, score: u64) -> MatchEvent {
        MatchEvent::ScoreUpdated {
            match_id,
            participant_id: Uuid::new_v4(),
            score,
            leaderboard: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_two_viewers_receive_once_in_order() {
        let router = RoomRouter::new(30, 10);
        let match_id = Uuid::new_v4();
        let viewer_a = Uuid::new_v4();
        let viewer_b = Uuid::new_v4();

        let mut rx_a = router.subscribe(match_id, viewer_a);
        let mut rx_b = router.subscribe(match_id, viewer_b);

        // Drain the join notifications both viewers saw.
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            MatchEvent::ViewerJoined { count: 2, .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            MatchEvent::ViewerJoined { count: 2, .. }
        ));

        router.publish(match_id, score_event(match_id, 1));
        router.publish(match_id, score_event(match_id, 2));

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                MatchEvent::ScoreUpdated { score, .. } => assert_eq!(score, 1),
                other => panic!("unexpected event {:?}", other),
            }
            match rx.recv().await.unwrap() {
                MatchEvent::ScoreUpdated { score, .. } => assert_eq!(score, 2),
                other => panic!("unexpected event {:?}", other),
            }
            // Exactly once: nothing further is pending.
            assert!(matches!(
                rx.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ));
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let router = RoomRouter::new(30, 10);
        let match_id = Uuid::new_v4();
        let viewer = Uuid::new_v4();

        let _rx1 = router.subscribe(match_id, viewer);
        let _rx2 = router.subscribe(match_id, viewer);
        assert_eq!(router.viewer_count(match_id), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_absent_is_noop() {
        let router = RoomRouter::new(30, 10);
        let match_id = Uuid::new_v4();

        router.unsubscribe(match_id, Uuid::new_v4());
        assert_eq!(router.viewer_count(match_id), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_notifies_remaining_viewers() {
        let router = RoomRouter::new(30, 10);
        let match_id = Uuid::new_v4();
        let staying = Uuid::new_v4();
        let leaving = Uuid::new_v4();

        let mut rx = router.subscribe(match_id, staying);
        let _rx_leaving = router.subscribe(match_id, leaving);

        rx.recv().await.unwrap(); // own join
        rx.recv().await.unwrap(); // leaving viewer's join

        router.unsubscribe(match_id, leaving);
        match rx.recv().await.unwrap() {
            MatchEvent::ViewerLeft {
                viewer_id, count, ..
            } => {
                assert_eq!(viewer_id, leaving);
                assert_eq!(count, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_room_drops() {
        let router = RoomRouter::new(30, 10);
        let match_id = Uuid::new_v4();
        assert_eq!(router.publish(match_id, score_event(match_id, 1)), 0);
    }

    #[tokio::test]
    async fn test_no_cross_room_delivery() {
        let router = RoomRouter::new(30, 10);
        let match_a = Uuid::new_v4();
        let match_b = Uuid::new_v4();

        let mut rx = router.subscribe(match_a, Uuid::new_v4());
        rx.recv().await.unwrap(); // own join

        router.publish(match_b, score_event(match_b, 9));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_warns_then_closes() {
        let router = Arc::new(RoomRouter::new(30, 10));
        let match_id = Uuid::new_v4();
        let mut rx = router.subscribe(match_id, Uuid::new_v4());
        rx.recv().await.unwrap(); // own join

        Arc::clone(&router).schedule_teardown(match_id);

        tokio::time::advance(Duration::from_secs(31)).await;
        match rx.recv().await.unwrap() {
            MatchEvent::RoomClosing { close_in_secs, .. } => assert_eq!(close_in_secs, 10),
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(router.viewer_count(match_id), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_forwards_engine_events() {
        let router = Arc::new(RoomRouter::new(30, 10));
        let (tx, rx_events) = broadcast::channel(16);
        let match_id = Uuid::new_v4();

        let mut viewer_rx = router.subscribe(match_id, Uuid::new_v4());
        viewer_rx.recv().await.unwrap(); // own join

        tokio::spawn(run_event_dispatcher(rx_events, Arc::clone(&router)));
        tx.send(score_event(match_id, 7)).unwrap();

        match viewer_rx.recv().await.unwrap() {
            MatchEvent::ScoreUpdated { score, .. } => assert_eq!(score, 7),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
