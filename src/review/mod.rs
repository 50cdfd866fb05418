//! Read-only summary of a finished or running meeting, built from the turn
//! log and the session counters.

use std::collections::BTreeMap;

use log::error;
use serde::Serialize;

use crate::{
    backend::ClarityBackend,
    db::{LiveSessionState, LiveTurn, TurnFlag, MAX_RATING},
};

pub const EMPTY_REVIEW_MESSAGE: &str = "No ideas discussed yet";

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSummary {
    pub me: String,
    pub ideas_discussed: u32,
    pub ideas_understood: u32,
    pub understood_percent: u32,
    pub turns: Vec<LiveTurn>,
    pub flagged: Vec<LiveTurn>,
    pub unflagged: Vec<LiveTurn>,
    pub my_flags: Vec<LiveTurn>,
    pub partner_flags: Vec<LiveTurn>,
}

/// `round(100 * understood / discussed)`, halves rounding up. Zero when
/// nothing was discussed.
pub fn understood_percent(understood: u32, discussed: u32) -> u32 {
    if discussed == 0 {
        return 0;
    }
    let (u, d) = (u64::from(understood), u64::from(discussed));
    ((200 * u + d) / (2 * d)) as u32
}

/// Counters recovered from the turn log alone: one resolution turn per
/// round, understood when both ratings were at the maximum. Duplicate
/// resolutions of the same round count once.
fn count_from_turns(turns: &[LiveTurn]) -> (u32, u32) {
    let mut rounds: BTreeMap<u32, bool> = BTreeMap::new();
    for turn in turns {
        if turn.flag == Some(TurnFlag::Misunderstood) {
            continue;
        }
        let understood =
            turn.checker_rating == Some(MAX_RATING) && turn.responder_rating == Some(MAX_RATING);
        *rounds.entry(turn.round).or_default() |= understood;
    }

    let discussed = rounds.len() as u32;
    let understood = rounds.values().filter(|understood| **understood).count() as u32;
    (discussed, understood)
}

impl ReviewSummary {
    pub fn build(me: &str, live: Option<&LiveSessionState>, turns: Vec<LiveTurn>) -> Self {
        let (ideas_discussed, ideas_understood) = match live {
            Some(state) => (state.ideas_discussed, state.ideas_understood),
            None => count_from_turns(&turns),
        };

        let (flagged, unflagged): (Vec<LiveTurn>, Vec<LiveTurn>) =
            turns.iter().cloned().partition(LiveTurn::is_flagged);
        let (my_flags, partner_flags): (Vec<LiveTurn>, Vec<LiveTurn>) = flagged
            .iter()
            .cloned()
            .partition(|turn| turn.actor == me);

        Self {
            me: me.to_string(),
            ideas_discussed,
            ideas_understood,
            understood_percent: understood_percent(ideas_understood, ideas_discussed),
            turns,
            flagged,
            unflagged,
            my_flags,
            partner_flags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.ideas_discussed == 0
    }

    pub fn lines(&self) -> Vec<String> {
        if self.is_empty() {
            return vec![EMPTY_REVIEW_MESSAGE.to_string()];
        }

        let mut lines = vec![
            format!("Ideas discussed: {}", self.ideas_discussed),
            format!(
                "Ideas understood: {} ({}%)",
                self.ideas_understood, self.understood_percent
            ),
            format!(
                "Flags raised: {} (you {}, partner {})",
                self.flagged.len(),
                self.my_flags.len(),
                self.partner_flags.len()
            ),
        ];

        for turn in &self.flagged {
            let who = if turn.actor == self.me {
                "you"
            } else {
                turn.actor.as_str()
            };
            let what = match turn.flag {
                Some(TurnFlag::Skipped) => "skipped",
                _ => "flagged a misunderstanding",
            };
            let mut line = format!("  Round {}: {who} {what}", turn.round);
            if let Some(note) = &turn.note {
                line.push_str(&format!(" ({note})"));
            }
            lines.push(line);
        }

        lines
    }
}

/// Fetch and summarise a session. Read failures are logged and produce an
/// empty review.
pub async fn load_review(backend: &ClarityBackend, session_id: &str, me: &str) -> ReviewSummary {
    let live = match backend.get_snapshot(session_id).await {
        Ok(snapshot) => snapshot.map(|snapshot| snapshot.live),
        Err(e) => {
            error!("Failed to load session {session_id} for review: {e:#}");
            None
        }
    };

    let turns = match backend.get_live_turns(session_id).await {
        Ok(turns) => turns,
        Err(e) => {
            error!("Failed to load turns for session {session_id}: {e:#}");
            Vec::new()
        }
    };

    ReviewSummary::build(me, live.as_ref(), turns)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn turn(round: u32, actor: &str, flag: Option<TurnFlag>, ratings: (u8, u8)) -> LiveTurn {
        LiveTurn {
            id: format!("t{round}-{actor}"),
            session_id: "s1".into(),
            round,
            actor: actor.into(),
            flag,
            note: None,
            checker_rating: Some(ratings.0),
            responder_rating: Some(ratings.1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percent_rounds_and_never_divides_by_zero() {
        assert_eq!(understood_percent(0, 0), 0);
        assert_eq!(understood_percent(5, 0), 0);
        assert_eq!(understood_percent(1, 3), 33);
        assert_eq!(understood_percent(2, 3), 67);
        assert_eq!(understood_percent(1, 8), 13);
        assert_eq!(understood_percent(4, 4), 100);
    }

    #[test]
    fn empty_log_says_so() {
        let review = ReviewSummary::build("Alice", Some(&LiveSessionState::default()), vec![]);
        assert!(review.is_empty());
        assert_eq!(review.understood_percent, 0);
        assert_eq!(review.lines(), vec![EMPTY_REVIEW_MESSAGE.to_string()]);
    }

    #[test]
    fn flags_split_by_actor() {
        let turns = vec![
            turn(1, "Alice", None, (10, 10)),
            turn(2, "Bob", Some(TurnFlag::Skipped), (4, 6)),
            turn(2, "Alice", Some(TurnFlag::Misunderstood), (4, 6)),
            turn(3, "Alice", None, (8, 8)),
        ];
        let live = LiveSessionState {
            ideas_discussed: 3,
            ideas_understood: 1,
            ..LiveSessionState::default()
        };

        let review = ReviewSummary::build("Alice", Some(&live), turns);
        assert_eq!(review.understood_percent, 33);
        assert_eq!(review.flagged.len(), 2);
        assert_eq!(review.unflagged.len(), 2);
        assert_eq!(review.my_flags.len(), 1);
        assert_eq!(review.partner_flags[0].actor, "Bob");

        let lines = review.lines();
        assert_eq!(lines[1], "Ideas understood: 1 (33%)");
        assert!(lines.contains(&"  Round 2: Bob skipped".to_string()));
        assert!(lines.contains(&"  Round 2: you flagged a misunderstanding".to_string()));
    }

    #[test]
    fn falls_back_to_counting_resolutions() {
        let turns = vec![
            turn(1, "Alice", None, (10, 10)),
            // Both clients resolved round 1 at once.
            turn(1, "Bob", None, (10, 10)),
            turn(1, "Bob", Some(TurnFlag::Misunderstood), (10, 10)),
            turn(2, "Bob", Some(TurnFlag::Skipped), (10, 9)),
        ];

        let review = ReviewSummary::build("Bob", None, turns);
        assert_eq!(review.ideas_discussed, 2);
        assert_eq!(review.ideas_understood, 1);
        assert_eq!(review.understood_percent, 50);
    }
}
