//! Clarity session records.
//!
//! A `ClaritySession` is created by the participant who starts a meeting and
//! is shared with exactly one partner. The live round state lives on the same
//! row and is broadcast together with it as a `SessionSnapshot`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::live_state::LiveSessionState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaritySession {
    pub id: String,
    pub creator_name: String,
    pub joiner_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ClaritySession {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_participant(&self, name: &str) -> bool {
        self.creator_name == name || self.joiner_name.as_deref() == Some(name)
    }

    /// The other participant, if they have joined.
    pub fn partner_of(&self, name: &str) -> Option<&str> {
        if self.creator_name == name {
            self.joiner_name.as_deref()
        } else if self.joiner_name.as_deref() == Some(name) {
            Some(self.creator_name.as_str())
        } else {
            None
        }
    }
}

/// Everything a client needs to redraw: the session row plus its live state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: ClaritySession,
    pub live: LiveSessionState,
}
