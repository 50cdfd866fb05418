//! Append-only turn log entries.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TurnFlag {
    Misunderstood,
    Skipped,
}

impl TurnFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnFlag::Misunderstood => "misunderstood",
            TurnFlag::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "misunderstood" => Ok(TurnFlag::Misunderstood),
            "skipped" => Ok(TurnFlag::Skipped),
            other => Err(anyhow!("unknown turn flag {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveTurn {
    pub id: String,
    pub session_id: String,
    pub round: u32,
    pub actor: String,
    pub flag: Option<TurnFlag>,
    pub note: Option<String>,
    pub checker_rating: Option<u8>,
    pub responder_rating: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl LiveTurn {
    pub fn is_flagged(&self) -> bool {
        self.flag.is_some()
    }
}
