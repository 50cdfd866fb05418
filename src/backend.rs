use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::{ClaritySession, Database, LiveStatePatch, LiveTurn, SessionSnapshot},
    realtime::{RealtimeHub, Subscription},
};

pub const MAX_NAME_LEN: usize = 80;

/// Trim a participant name and reject empty or oversized ones.
pub fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.chars().count() > MAX_NAME_LEN {
        bail!("name must be at most {MAX_NAME_LEN} characters");
    }
    Ok(name.to_string())
}

/// Remote operations a meeting client relies on: the session store plus the
/// realtime channel. Every mutation publishes the resulting snapshot.
#[derive(Clone)]
pub struct ClarityBackend {
    db: Database,
    hub: RealtimeHub,
    poll_interval: Option<Duration>,
}

impl ClarityBackend {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            hub: RealtimeHub::default(),
            poll_interval: None,
        }
    }

    /// Also watch the database for writes made by other processes sharing the
    /// same file.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub async fn create_clarity_session(&self, creator_name: &str) -> Result<String> {
        let creator_name = normalize_name(creator_name)?;
        let now = Utc::now();
        let session = ClaritySession {
            id: Uuid::new_v4().to_string(),
            creator_name,
            joiner_name: None,
            created_at: now,
            ended_at: None,
            updated_at: now,
        };

        self.db
            .insert_session(&session)
            .await
            .context("failed to create clarity session")?;
        info!("{} started session {}", session.creator_name, session.id);
        Ok(session.id)
    }

    pub async fn join_clarity_session(
        &self,
        session_id: &str,
        joiner_name: &str,
    ) -> Result<SessionSnapshot> {
        let joiner_name = normalize_name(joiner_name)?;
        let snapshot = self
            .db
            .set_session_joiner(session_id, &joiner_name, Utc::now())
            .await
            .with_context(|| format!("{joiner_name} could not join session {session_id}"))?;
        info!("{joiner_name} joined session {session_id}");
        self.hub.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn get_clarity_session(&self, session_id: &str) -> Result<Option<ClaritySession>> {
        self.db.get_session(session_id).await
    }

    pub async fn get_snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        self.db.get_snapshot(session_id).await
    }

    /// Deliver every future snapshot of `session_id` to `on_change` until the
    /// subscription is dropped.
    pub fn subscribe_to_clarity_session<F>(&self, session_id: &str, on_change: F) -> Subscription
    where
        F: Fn(SessionSnapshot) + Send + 'static,
    {
        let mut subscription = self.hub.subscribe(session_id, on_change);

        if let Some(interval) = self.poll_interval {
            let db = self.db.clone();
            let hub = self.hub.clone();
            let session_id = session_id.to_string();
            subscription.spawn_linked(move |cancel_token| async move {
                let mut ticker = tokio::time::interval(interval);
                let mut last_seen: Option<SessionSnapshot> = None;
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match db.get_snapshot(&session_id).await {
                        Ok(Some(snapshot)) => {
                            if last_seen.as_ref() == Some(&snapshot) {
                                continue;
                            }
                            // The first read only sets the baseline.
                            if last_seen.is_some() {
                                debug!("session {session_id} changed on disk, republishing");
                                hub.publish(snapshot.clone());
                            }
                            last_seen = Some(snapshot);
                        }
                        Ok(None) => {
                            warn!("session {session_id} disappeared, stopping poller");
                            break;
                        }
                        Err(e) => warn!("polling session {session_id} failed: {e:#}"),
                    }
                }
            });
        }

        subscription
    }

    /// Merge `patch` into the live state. An empty patch is a read.
    pub async fn update_clarity_session_live_state(
        &self,
        session_id: &str,
        patch: LiveStatePatch,
    ) -> Result<SessionSnapshot> {
        self.commit_live_state(session_id, patch, None).await
    }

    /// Merge `patch` and log `turn` together: a resolved round never lands
    /// without its turn, nor the turn without the round.
    pub async fn resolve_live_round(
        &self,
        session_id: &str,
        patch: LiveStatePatch,
        turn: LiveTurn,
    ) -> Result<SessionSnapshot> {
        self.commit_live_state(session_id, patch, Some(turn)).await
    }

    async fn commit_live_state(
        &self,
        session_id: &str,
        patch: LiveStatePatch,
        turn: Option<LiveTurn>,
    ) -> Result<SessionSnapshot> {
        if patch.is_empty() && turn.is_none() {
            return self
                .db
                .get_snapshot(session_id)
                .await?
                .with_context(|| format!("session {session_id} not found"));
        }

        let snapshot = self
            .db
            .apply_live_state_patch_with_turn(session_id, patch, turn, Utc::now())
            .await
            .with_context(|| format!("failed to update live state of session {session_id}"))?;
        self.hub.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn get_live_turns(&self, session_id: &str) -> Result<Vec<LiveTurn>> {
        self.db.get_turns_for_session(session_id).await
    }

    pub async fn append_live_turn(&self, turn: &LiveTurn) -> Result<()> {
        self.db
            .insert_turn(turn)
            .await
            .with_context(|| format!("failed to log round {} of {}", turn.round, turn.session_id))
    }

    pub async fn clear_session_joiner(&self, session_id: &str) -> Result<SessionSnapshot> {
        let snapshot = self.db.clear_session_joiner(session_id, Utc::now()).await?;
        info!("partner left session {session_id}");
        self.hub.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn end_clarity_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let snapshot = self.db.end_session(session_id, Utc::now()).await?;
        info!("session {session_id} ended");
        self.hub.publish(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn list_clarity_sessions(&self, limit: usize) -> Result<Vec<ClaritySession>> {
        self.db.list_sessions(limit).await
    }

    /// End sessions nobody has touched for `older_than`, e.g. after a crash.
    pub async fn end_stale_sessions(&self, older_than: chrono::Duration) -> Result<Vec<String>> {
        let ended = self.db.end_stale_sessions(Utc::now() - older_than).await?;
        if !ended.is_empty() {
            info!("ended {} stale sessions", ended.len());
        }
        Ok(ended)
    }
}
