use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::db::SessionSnapshot;

use super::Subscription;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

type Channels = HashMap<String, broadcast::Sender<Arc<SessionSnapshot>>>;

/// In-process pub/sub keyed by session id.
///
/// Each snapshot is a complete picture of the session, so a subscriber that
/// falls behind skips straight to the newest one instead of replaying.
#[derive(Clone)]
pub struct RealtimeHub {
    channels: Arc<Mutex<Channels>>,
    capacity: usize,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, Channels> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver `snapshot` to every subscriber of its session. Returns how many
    /// receivers it reached.
    pub fn publish(&self, snapshot: SessionSnapshot) -> usize {
        let session_id = snapshot.session.id.clone();
        let mut channels = self.channels();

        let Some(sender) = channels.get(&session_id) else {
            return 0;
        };

        match sender.send(Arc::new(snapshot)) {
            Ok(count) => count,
            Err(_) => {
                // Every subscriber is gone.
                channels.remove(&session_id);
                log_debug!("pruned idle channel for session {}", session_id);
                0
            }
        }
    }

    pub fn receiver(&self, session_id: &str) -> broadcast::Receiver<Arc<SessionSnapshot>> {
        let mut channels = self.channels();
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sessions that currently have a channel.
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Drop the channel for `session_id` once nobody listens on it.
    fn prune(&self, session_id: &str) {
        let mut channels = self.channels();
        let idle = channels
            .get(session_id)
            .map_or(false, |sender| sender.receiver_count() == 0);
        if idle {
            channels.remove(session_id);
            log_debug!("pruned idle channel for session {}", session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels()
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Call `on_change` with every snapshot published for `session_id` until
    /// the returned subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, session_id: &str, on_change: F) -> Subscription
    where
        F: Fn(SessionSnapshot) + Send + 'static,
    {
        let mut rx = self.receiver(session_id);
        let mut subscription = Subscription::new(session_id.to_string(), CancellationToken::new());
        let session_id = session_id.to_string();
        let hub = self.clone();

        subscription.spawn_linked(move |cancel_token| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    message = rx.recv() => match message {
                        Ok(snapshot) => on_change(snapshot.as_ref().clone()),
                        Err(RecvError::Lagged(skipped)) => {
                            log_warn!(
                                "subscriber for session {} lagged, skipped {} snapshots",
                                session_id,
                                skipped
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            drop(rx);
            hub.prune(&session_id);
            log_debug!("subscription to session {} closed", session_id);
        });

        subscription
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::db::{ClaritySession, LiveSessionState};

    fn snapshot(id: &str, discussed: u32) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            session: ClaritySession {
                id: id.into(),
                creator_name: "Alice".into(),
                joiner_name: Some("Bob".into()),
                created_at: now,
                ended_at: None,
                updated_at: now,
            },
            live: LiveSessionState {
                ideas_discussed: discussed,
                ..LiveSessionState::default()
            },
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let hub = RealtimeHub::default();
        assert_eq!(hub.publish(snapshot("s1", 0)), 0);
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_own_session() {
        let hub = RealtimeHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = hub.subscribe("s1", move |snap| {
            let _ = tx.send(snap.live.ideas_discussed);
        });

        hub.publish(snapshot("s2", 9));
        hub.publish(snapshot("s1", 1));

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(1));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = RealtimeHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = hub.subscribe("s1", move |snap| {
            let _ = tx.send(snap.live.ideas_discussed);
        });
        assert_eq!(hub.subscriber_count("s1"), 1);
        assert_eq!(sub.session_id(), "s1");
        assert!(sub.is_active());

        sub.unsubscribe();
        // The sender half lives in the forwarding task; once it exits the
        // channel closes.
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(closed, None);

        assert_eq!(hub.publish(snapshot("s1", 2)), 0);
        assert_eq!(hub.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn last_unsubscribe_drops_the_channel() {
        let hub = RealtimeHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = hub.subscribe("s1", move |snap| {
            let _ = tx.send(snap.live.ideas_discussed);
        });
        let second = hub.subscribe("s1", |_| {});
        assert_eq!(hub.channel_count(), 1);

        // The callback is dropped after the task has pruned.
        first.unsubscribe();
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.subscriber_count("s1"), 1);

        drop(second);
        timeout(Duration::from_secs(1), async {
            while hub.channel_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_latest() {
        let hub = RealtimeHub::new(2);
        let mut rx = hub.receiver("s1");
        for n in 0..5 {
            hub.publish(snapshot("s1", n));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().live.ideas_discussed, 3);
        assert_eq!(rx.recv().await.unwrap().live.ideas_discussed, 4);
    }
}
