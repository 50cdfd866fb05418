use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::debug;

use crate::db::{
    connection::Database,
    models::{LiveStatePatch, LiveTurn, SessionSnapshot},
};

use super::{
    sessions::{next_stamp, require_snapshot, write_live_state},
    turns::insert_turn_row,
};

impl Database {
    /// Merge `patch` into the stored live state and return the result.
    ///
    /// The read, merge, and write hold the write lock together, so two
    /// clients that touch different fields (checker vs responder rating) both
    /// land, even from different processes. Fields written by both resolve
    /// last-write-wins.
    pub async fn apply_live_state_patch(
        &self,
        session_id: &str,
        patch: LiveStatePatch,
        updated_at: DateTime<Utc>,
    ) -> Result<SessionSnapshot> {
        self.apply_live_state_patch_with_turn(session_id, patch, None, updated_at)
            .await
    }

    /// Like [`Database::apply_live_state_patch`], also logging `turn` in the
    /// same transaction. Either both are stored or neither is.
    pub async fn apply_live_state_patch_with_turn(
        &self,
        session_id: &str,
        patch: LiveStatePatch,
        turn: Option<LiveTurn>,
        updated_at: DateTime<Utc>,
    ) -> Result<SessionSnapshot> {
        let session_id = session_id.to_string();
        self.write(move |tx| {
            let current = require_snapshot(tx, &session_id)?;
            if current.session.is_ended() {
                bail!("session {session_id} has ended");
            }

            let mut merged = current.live.clone();
            patch.apply_to(&mut merged);
            if merged.reconcile() {
                debug!("session {session_id}: both ratings present, promoted to revealed");
            }

            let stamp = next_stamp(&current.session, updated_at);
            write_live_state(tx, &session_id, &merged, stamp)?;
            if let Some(turn) = &turn {
                insert_turn_row(tx, turn)?;
            }
            require_snapshot(tx, &session_id)
        })
        .await
    }
}
