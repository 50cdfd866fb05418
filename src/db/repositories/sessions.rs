use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, parse_datetime, parse_optional_datetime, parse_phase, to_rating, to_u32,
    },
    models::{ClaritySession, LiveSessionState, SessionSnapshot},
};

pub(crate) const SESSION_COLUMNS: &str = "id, creator_name, joiner_name, created_at, ended_at, updated_at, \
     rating_phase, checker_name, prover_name, checker_rating, responder_rating, \
     checker_submitted, responder_submitted, ideas_discussed, ideas_understood";

fn row_to_session(row: &Row) -> Result<ClaritySession> {
    let created_at: String = row.get("created_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(ClaritySession {
        id: row.get("id")?,
        creator_name: row.get("creator_name")?,
        joiner_name: row.get("joiner_name")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn row_to_live_state(row: &Row) -> Result<LiveSessionState> {
    let phase: String = row.get("rating_phase")?;
    let discussed: i64 = row.get("ideas_discussed")?;
    let understood: i64 = row.get("ideas_understood")?;

    Ok(LiveSessionState {
        rating_phase: parse_phase(&phase)?,
        checker_name: row.get("checker_name")?,
        prover_name: row.get("prover_name")?,
        checker_rating: to_rating(row.get("checker_rating")?, "checker_rating")?,
        responder_rating: to_rating(row.get("responder_rating")?, "responder_rating")?,
        checker_submitted: row.get("checker_submitted")?,
        responder_submitted: row.get("responder_submitted")?,
        ideas_discussed: to_u32(discussed, "ideas_discussed")?,
        ideas_understood: to_u32(understood, "ideas_understood")?,
    })
}

/// Load a session row together with its live state. Read-modify-write
/// callers run this inside [`Database::write`].
pub(crate) fn load_snapshot(conn: &Connection, session_id: &str) -> Result<Option<SessionSnapshot>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM clarity_sessions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![session_id])?;
    let snapshot = match rows.next()? {
        Some(row) => Some(SessionSnapshot {
            session: row_to_session(row)?,
            live: row_to_live_state(row)?,
        }),
        None => None,
    };
    Ok(snapshot)
}

pub(crate) fn require_snapshot(conn: &Connection, session_id: &str) -> Result<SessionSnapshot> {
    load_snapshot(conn, session_id)?.ok_or_else(|| anyhow!("session {session_id} not found"))
}

/// Every write moves `updated_at` strictly forward, even when the clock (or
/// the caller's requested time) lags the stored one. Stamps are stored with
/// microsecond precision, so one microsecond is the smallest visible step.
/// Clients rely on this to drop any snapshot not newer than the one they hold.
pub(crate) fn next_stamp(current: &ClaritySession, requested: DateTime<Utc>) -> DateTime<Utc> {
    requested.max(current.updated_at + Duration::microseconds(1))
}

pub(crate) fn write_live_state(
    conn: &Connection,
    session_id: &str,
    live: &LiveSessionState,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE clarity_sessions
         SET rating_phase = ?1,
             checker_name = ?2,
             prover_name = ?3,
             checker_rating = ?4,
             responder_rating = ?5,
             checker_submitted = ?6,
             responder_submitted = ?7,
             ideas_discussed = ?8,
             ideas_understood = ?9,
             updated_at = ?10
         WHERE id = ?11",
        params![
            live.rating_phase.as_str(),
            live.checker_name,
            live.prover_name,
            live.checker_rating,
            live.responder_rating,
            live.checker_submitted,
            live.responder_submitted,
            live.ideas_discussed,
            live.ideas_understood,
            format_datetime(&updated_at),
            session_id,
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn insert_session(&self, session: &ClaritySession) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO clarity_sessions (id, creator_name, joiner_name, created_at, ended_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.creator_name,
                    record.joiner_name,
                    format_datetime(&record.created_at),
                    record.ended_at.as_ref().map(format_datetime),
                    format_datetime(&record.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ClaritySession>> {
        Ok(self
            .get_snapshot(session_id)
            .await?
            .map(|snapshot| snapshot.session))
    }

    pub async fn get_snapshot(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| load_snapshot(conn, &session_id)).await
    }

    /// Record the partner on an open session. Re-joining under the same name
    /// is allowed so a reconnecting client does not fail.
    pub async fn set_session_joiner(
        &self,
        session_id: &str,
        joiner_name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<SessionSnapshot> {
        let session_id = session_id.to_string();
        let joiner_name = joiner_name.to_string();
        self.write(move |tx| {
            let current = require_snapshot(tx, &session_id)?;
            if current.session.is_ended() {
                bail!("session {session_id} has ended");
            }
            if current.session.creator_name == joiner_name {
                bail!("{joiner_name} already started this session");
            }
            match current.session.joiner_name.as_deref() {
                Some(existing) if existing == joiner_name => return Ok(current),
                Some(_) => bail!("session {session_id} already has a partner"),
                None => {}
            }

            let stamp = next_stamp(&current.session, updated_at);
            tx.execute(
                "UPDATE clarity_sessions
                 SET joiner_name = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![joiner_name, format_datetime(&stamp), session_id],
            )?;
            require_snapshot(tx, &session_id)
        })
        .await
    }

    /// Drop the partner. An unfinished round cannot complete without them, so
    /// the round fields are reset; the counters survive.
    pub async fn clear_session_joiner(
        &self,
        session_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<SessionSnapshot> {
        let session_id = session_id.to_string();
        self.write(move |tx| {
            let current = require_snapshot(tx, &session_id)?;
            let stamp = next_stamp(&current.session, updated_at);

            tx.execute(
                "UPDATE clarity_sessions
                 SET joiner_name = NULL,
                     updated_at = ?1
                 WHERE id = ?2",
                params![format_datetime(&stamp), session_id],
            )?;

            let reset = LiveSessionState {
                ideas_discussed: current.live.ideas_discussed,
                ideas_understood: current.live.ideas_understood,
                ..LiveSessionState::default()
            };
            write_live_state(tx, &session_id, &reset, stamp)?;
            require_snapshot(tx, &session_id)
        })
        .await
    }

    /// Mark the session ended. Ending twice keeps the first timestamp.
    pub async fn end_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<SessionSnapshot> {
        let session_id = session_id.to_string();
        self.write(move |tx| {
            let current = require_snapshot(tx, &session_id)?;
            if current.session.is_ended() {
                return Ok(current);
            }

            let stamp = next_stamp(&current.session, ended_at);
            tx.execute(
                "UPDATE clarity_sessions
                 SET ended_at = ?1,
                     updated_at = ?1
                 WHERE id = ?2",
                params![format_datetime(&stamp), session_id],
            )?;
            require_snapshot(tx, &session_id)
        })
        .await
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<ClaritySession>> {
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM clarity_sessions
                 ORDER BY created_at DESC
                 LIMIT ?1"
            ))?;

            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    /// End every open session untouched since `cutoff`. Returns the ids ended.
    pub async fn end_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.write(move |tx| {
            let stale = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM clarity_sessions
                     WHERE ended_at IS NULL AND updated_at < ?1"
                ))?;
                let mut rows = stmt.query(params![format_datetime(&cutoff)])?;
                let mut stale = Vec::new();
                while let Some(row) = rows.next()? {
                    stale.push(row_to_session(row)?);
                }
                stale
            };

            let now = Utc::now();
            for session in &stale {
                let stamp = next_stamp(session, now);
                tx.execute(
                    "UPDATE clarity_sessions
                     SET ended_at = ?1,
                         updated_at = ?1
                     WHERE id = ?2",
                    params![format_datetime(&stamp), session.id],
                )?;
            }

            Ok(stale.into_iter().map(|session| session.id).collect())
        })
        .await
    }
}
