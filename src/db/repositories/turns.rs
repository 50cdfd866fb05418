use anyhow::Result;
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, to_rating, to_u32},
    models::{LiveTurn, TurnFlag},
};

fn row_to_turn(row: &Row) -> Result<LiveTurn> {
    let round: i64 = row.get("round")?;
    let flag: Option<String> = row.get("flag")?;
    let created_at: String = row.get("created_at")?;

    Ok(LiveTurn {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        round: to_u32(round, "round")?,
        actor: row.get("actor")?,
        flag: flag.as_deref().map(TurnFlag::parse).transpose()?,
        note: row.get("note")?,
        checker_rating: to_rating(row.get("checker_rating")?, "checker_rating")?,
        responder_rating: to_rating(row.get("responder_rating")?, "responder_rating")?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

pub(crate) fn insert_turn_row(conn: &Connection, turn: &LiveTurn) -> Result<()> {
    conn.execute(
        "INSERT INTO live_turns (id, session_id, round, actor, flag, note, checker_rating, responder_rating, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            turn.id,
            turn.session_id,
            turn.round,
            turn.actor,
            turn.flag.map(|flag| flag.as_str()),
            turn.note,
            turn.checker_rating,
            turn.responder_rating,
            format_datetime(&turn.created_at),
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn insert_turn(&self, turn: &LiveTurn) -> Result<()> {
        let record = turn.clone();
        self.execute(move |conn| insert_turn_row(conn, &record)).await
    }

    /// Turns for a session in the order they were logged.
    pub async fn get_turns_for_session(&self, session_id: &str) -> Result<Vec<LiveTurn>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, round, actor, flag, note, checker_rating, responder_rating, created_at
                 FROM live_turns
                 WHERE session_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                turns.push(row_to_turn(row)?);
            }

            Ok(turns)
        })
        .await
    }
}
