//! Flat live-round record as stored on the session row and sent over the wire.
//!
//! The in-memory state machine works on the tagged `live::LiveState`; this is
//! the shape both clients read and write.

use serde::{Deserialize, Serialize};

pub const MAX_RATING: u8 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RatingPhase {
    Idle,
    Rating,
    Waiting,
    Revealed,
}

impl Default for RatingPhase {
    fn default() -> Self {
        RatingPhase::Idle
    }
}

impl RatingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatingPhase::Idle => "idle",
            RatingPhase::Rating => "rating",
            RatingPhase::Waiting => "waiting",
            RatingPhase::Revealed => "revealed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSessionState {
    pub rating_phase: RatingPhase,
    pub checker_name: Option<String>,
    pub prover_name: Option<String>,
    pub checker_rating: Option<u8>,
    pub responder_rating: Option<u8>,
    pub checker_submitted: bool,
    pub responder_submitted: bool,
    pub ideas_discussed: u32,
    pub ideas_understood: u32,
}

impl LiveSessionState {
    /// Promote a round whose two sides have both submitted to `Revealed`.
    ///
    /// Two clients submitting at the same moment each write `Waiting`; the
    /// merged row then carries both ratings and must still reveal.
    pub fn reconcile(&mut self) -> bool {
        let in_round = matches!(
            self.rating_phase,
            RatingPhase::Rating | RatingPhase::Waiting
        );
        let both_in = self.checker_submitted
            && self.responder_submitted
            && self.checker_rating.is_some()
            && self.responder_rating.is_some();

        if in_round && both_in {
            self.rating_phase = RatingPhase::Revealed;
            true
        } else {
            false
        }
    }
}

/// Field-level update to a `LiveSessionState`. `None` leaves a field alone;
/// for nullable columns `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStatePatch {
    pub rating_phase: Option<RatingPhase>,
    pub checker_name: Option<Option<String>>,
    pub prover_name: Option<Option<String>>,
    pub checker_rating: Option<Option<u8>>,
    pub responder_rating: Option<Option<u8>>,
    pub checker_submitted: Option<bool>,
    pub responder_submitted: Option<bool>,
    pub ideas_discussed: Option<u32>,
    pub ideas_understood: Option<u32>,
}

fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
    if old == new {
        None
    } else {
        Some(new.clone())
    }
}

impl LiveStatePatch {
    /// The smallest patch turning `old` into `new`.
    pub fn between(old: &LiveSessionState, new: &LiveSessionState) -> Self {
        Self {
            rating_phase: changed(&old.rating_phase, &new.rating_phase),
            checker_name: changed(&old.checker_name, &new.checker_name),
            prover_name: changed(&old.prover_name, &new.prover_name),
            checker_rating: changed(&old.checker_rating, &new.checker_rating),
            responder_rating: changed(&old.responder_rating, &new.responder_rating),
            checker_submitted: changed(&old.checker_submitted, &new.checker_submitted),
            responder_submitted: changed(&old.responder_submitted, &new.responder_submitted),
            ideas_discussed: changed(&old.ideas_discussed, &new.ideas_discussed),
            ideas_understood: changed(&old.ideas_understood, &new.ideas_understood),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, state: &mut LiveSessionState) {
        if let Some(phase) = self.rating_phase {
            state.rating_phase = phase;
        }
        if let Some(name) = &self.checker_name {
            state.checker_name = name.clone();
        }
        if let Some(name) = &self.prover_name {
            state.prover_name = name.clone();
        }
        if let Some(rating) = self.checker_rating {
            state.checker_rating = rating;
        }
        if let Some(rating) = self.responder_rating {
            state.responder_rating = rating;
        }
        if let Some(submitted) = self.checker_submitted {
            state.checker_submitted = submitted;
        }
        if let Some(submitted) = self.responder_submitted {
            state.responder_submitted = submitted;
        }
        if let Some(count) = self.ideas_discussed {
            state.ideas_discussed = count;
        }
        if let Some(count) = self.ideas_understood {
            state.ideas_understood = count;
        }
    }
}
