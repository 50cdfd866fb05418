//! Round protocol between the two participants of a clarity session.
//!
//! `LiveState` is the tagged, in-memory form of the flat
//! `LiveSessionState` record. Transitions are pure: `apply` never mutates,
//! it returns the next state plus the round outcome when a round resolves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{ClaritySession, LiveSessionState, RatingPhase, TurnFlag, MAX_RATING};

/// Which question opened the round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoundDirection {
    /// "Did you get it?" The initiator explained and checks the partner.
    Checking,
    /// "Did I get it?" The initiator proves they understood the partner.
    Proving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub direction: RoundDirection,
    pub initiator: String,
    pub responder: String,
    pub initiator_rating: Option<u8>,
    pub responder_rating: Option<u8>,
}

impl Round {
    fn new(direction: RoundDirection, initiator: &str, responder: &str) -> Self {
        Self {
            direction,
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            initiator_rating: None,
            responder_rating: None,
        }
    }

    pub fn side_of(&self, name: &str) -> Option<Side> {
        if self.initiator == name {
            Some(Side::Initiator)
        } else if self.responder == name {
            Some(Side::Responder)
        } else {
            None
        }
    }

    pub fn rating_of(&self, name: &str) -> Option<u8> {
        match self.side_of(name)? {
            Side::Initiator => self.initiator_rating,
            Side::Responder => self.responder_rating,
        }
    }

    pub fn partner_of(&self, name: &str) -> Option<&str> {
        match self.side_of(name)? {
            Side::Initiator => Some(self.responder.as_str()),
            Side::Responder => Some(self.initiator.as_str()),
        }
    }

    /// The participant demonstrating understanding, for "Did I get it?" rounds.
    pub fn prover(&self) -> Option<&str> {
        match self.direction {
            RoundDirection::Proving => Some(self.initiator.as_str()),
            RoundDirection::Checking => None,
        }
    }

    pub fn submitted_count(&self) -> usize {
        usize::from(self.initiator_rating.is_some()) + usize::from(self.responder_rating.is_some())
    }

    pub fn both_submitted(&self) -> bool {
        self.submitted_count() == 2
    }

    pub fn is_full_understanding(&self) -> bool {
        self.initiator_rating == Some(MAX_RATING) && self.responder_rating == Some(MAX_RATING)
    }

    /// Phase implied by how many sides have rated.
    fn phase(self) -> LivePhase {
        match self.submitted_count() {
            0 => LivePhase::Rating(self),
            1 => LivePhase::Waiting(self),
            _ => LivePhase::Revealed(self),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind", content = "round")]
pub enum LivePhase {
    Idle,
    Rating(Round),
    Waiting(Round),
    Revealed(Round),
}

impl LivePhase {
    pub fn round(&self) -> Option<&Round> {
        match self {
            LivePhase::Idle => None,
            LivePhase::Rating(round) | LivePhase::Waiting(round) | LivePhase::Revealed(round) => {
                Some(round)
            }
        }
    }

    pub fn rating_phase(&self) -> RatingPhase {
        match self {
            LivePhase::Idle => RatingPhase::Idle,
            LivePhase::Rating(_) => RatingPhase::Rating,
            LivePhase::Waiting(_) => RatingPhase::Waiting,
            LivePhase::Revealed(_) => RatingPhase::Revealed,
        }
    }
}

impl Default for LivePhase {
    fn default() -> Self {
        LivePhase::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveAction {
    StartCheck { by: String },
    StartProve { by: String },
    SubmitRating { by: String, value: u8 },
    /// "Good enough": close a revealed round.
    Acknowledge { by: String },
    /// Close a revealed round and log it as skipped.
    Skip { by: String },
    /// Auto-dismiss of a 10/10 reveal.
    CelebrationComplete,
    /// Local participant leaves the live view. Never written back.
    ExitMeeting,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("a round is already in progress")]
    RoundInProgress,
    #[error("no round in progress")]
    NoActiveRound,
    #[error("waiting for a partner to join")]
    NoPartner,
    #[error("{0} is not part of this meeting")]
    NotParticipant(String),
    #[error("rating {0} is outside 0..=10")]
    RatingOutOfRange(u8),
    #[error("{0} already rated this round")]
    AlreadySubmitted(String),
    #[error("ratings have not been revealed yet")]
    NotRevealed,
    #[error("only a 10/10 round can be celebrated")]
    NotCelebration,
}

/// How a round was closed, for the turn log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub round_number: u32,
    pub round: Round,
    pub actor: String,
    pub understood: bool,
    pub flag: Option<TurnFlag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: LiveState,
    pub resolved: Option<Resolution>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    pub phase: LivePhase,
    pub ideas_discussed: u32,
    pub ideas_understood: u32,
}

impl LiveState {
    /// Rebuild the tagged state from a stored record. The phase is derived
    /// from which sides have rated, so a record claiming `revealed` with one
    /// rating missing comes back as `Waiting`.
    pub fn from_record(record: &LiveSessionState, session: &ClaritySession) -> Self {
        let round = match (record.rating_phase, record.checker_name.as_deref()) {
            (RatingPhase::Idle, _) | (_, None) => None,
            (_, Some(initiator)) => {
                let direction = if record.prover_name.is_some() {
                    RoundDirection::Proving
                } else {
                    RoundDirection::Checking
                };
                let responder = session.partner_of(initiator).unwrap_or_default();
                Some(Round {
                    direction,
                    initiator: initiator.to_string(),
                    responder: responder.to_string(),
                    initiator_rating: record.checker_rating.filter(|_| record.checker_submitted),
                    responder_rating: record
                        .responder_rating
                        .filter(|_| record.responder_submitted),
                })
            }
        };

        Self {
            phase: round.map(Round::phase).unwrap_or(LivePhase::Idle),
            ideas_discussed: record.ideas_discussed,
            ideas_understood: record.ideas_understood,
        }
    }

    pub fn to_record(&self) -> LiveSessionState {
        let mut record = LiveSessionState {
            rating_phase: self.phase.rating_phase(),
            ideas_discussed: self.ideas_discussed,
            ideas_understood: self.ideas_understood,
            ..LiveSessionState::default()
        };

        if let Some(round) = self.phase.round() {
            record.checker_name = Some(round.initiator.clone());
            record.prover_name = round.prover().map(str::to_string);
            record.checker_rating = round.initiator_rating;
            record.responder_rating = round.responder_rating;
            record.checker_submitted = round.initiator_rating.is_some();
            record.responder_submitted = round.responder_rating.is_some();
        }

        record
    }

    pub fn round(&self) -> Option<&Round> {
        self.phase.round()
    }

    pub fn is_celebrating(&self) -> bool {
        matches!(&self.phase, LivePhase::Revealed(round) if round.is_full_understanding())
    }

    /// Number of the round in progress, or of the next one when idle.
    pub fn current_round_number(&self) -> u32 {
        self.ideas_discussed + 1
    }

    pub fn apply(
        &self,
        session: &ClaritySession,
        action: &LiveAction,
    ) -> Result<Transition, TransitionError> {
        match action {
            LiveAction::StartCheck { by } => self.start(session, by, RoundDirection::Checking),
            LiveAction::StartProve { by } => self.start(session, by, RoundDirection::Proving),
            LiveAction::SubmitRating { by, value } => self.submit(by, *value),
            LiveAction::Acknowledge { by } => self.resolve(Some(by), None),
            LiveAction::Skip { by } => self.resolve(Some(by), Some(TurnFlag::Skipped)),
            LiveAction::CelebrationComplete => {
                if let LivePhase::Revealed(round) = &self.phase {
                    if !round.is_full_understanding() {
                        return Err(TransitionError::NotCelebration);
                    }
                }
                self.resolve(None, None)
            }
            LiveAction::ExitMeeting => Ok(Transition {
                state: Self {
                    phase: LivePhase::Idle,
                    ..self.clone()
                },
                resolved: None,
            }),
        }
    }

    fn start(
        &self,
        session: &ClaritySession,
        by: &str,
        direction: RoundDirection,
    ) -> Result<Transition, TransitionError> {
        if !matches!(self.phase, LivePhase::Idle) {
            return Err(TransitionError::RoundInProgress);
        }
        if !session.is_participant(by) {
            return Err(TransitionError::NotParticipant(by.to_string()));
        }
        let partner = session.partner_of(by).ok_or(TransitionError::NoPartner)?;

        Ok(Transition {
            state: Self {
                phase: LivePhase::Rating(Round::new(direction, by, partner)),
                ..self.clone()
            },
            resolved: None,
        })
    }

    fn submit(&self, by: &str, value: u8) -> Result<Transition, TransitionError> {
        if value > MAX_RATING {
            return Err(TransitionError::RatingOutOfRange(value));
        }

        let mut round = match &self.phase {
            LivePhase::Idle => return Err(TransitionError::NoActiveRound),
            LivePhase::Revealed(_) => return Err(TransitionError::AlreadySubmitted(by.to_string())),
            LivePhase::Rating(round) | LivePhase::Waiting(round) => round.clone(),
        };

        let slot = match round.side_of(by) {
            Some(Side::Initiator) => &mut round.initiator_rating,
            Some(Side::Responder) => &mut round.responder_rating,
            None => return Err(TransitionError::NotParticipant(by.to_string())),
        };
        if slot.is_some() {
            return Err(TransitionError::AlreadySubmitted(by.to_string()));
        }
        *slot = Some(value);

        Ok(Transition {
            state: Self {
                phase: round.phase(),
                ..self.clone()
            },
            resolved: None,
        })
    }

    fn resolve(
        &self,
        by: Option<&String>,
        flag: Option<TurnFlag>,
    ) -> Result<Transition, TransitionError> {
        let round = match &self.phase {
            LivePhase::Revealed(round) => round,
            LivePhase::Idle => return Err(TransitionError::NoActiveRound),
            LivePhase::Rating(_) | LivePhase::Waiting(_) => {
                return Err(TransitionError::NotRevealed)
            }
        };

        let actor = match by {
            Some(name) if round.side_of(name).is_none() => {
                return Err(TransitionError::NotParticipant(name.clone()))
            }
            Some(name) => name.clone(),
            None => round.initiator.clone(),
        };

        let understood = round.is_full_understanding();
        let next = Self {
            phase: LivePhase::Idle,
            ideas_discussed: self.ideas_discussed + 1,
            ideas_understood: self.ideas_understood + u32::from(understood),
        };

        Ok(Transition {
            state: next,
            resolved: Some(Resolution {
                round_number: self.current_round_number(),
                round: round.clone(),
                actor,
                understood,
                flag,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn session() -> ClaritySession {
        let now = Utc::now();
        ClaritySession {
            id: "s1".into(),
            creator_name: "Alice".into(),
            joiner_name: Some("Bob".into()),
            created_at: now,
            ended_at: None,
            updated_at: now,
        }
    }

    fn step(state: &LiveState, action: LiveAction) -> Transition {
        state.apply(&session(), &action).unwrap()
    }

    fn check(by: &str) -> LiveAction {
        LiveAction::StartCheck { by: by.into() }
    }

    fn rate(by: &str, value: u8) -> LiveAction {
        LiveAction::SubmitRating {
            by: by.into(),
            value,
        }
    }

    fn revealed(a: u8, b: u8) -> LiveState {
        let s = step(&LiveState::default(), check("Alice")).state;
        let s = step(&s, rate("Alice", a)).state;
        step(&s, rate("Bob", b)).state
    }

    #[test]
    fn eight_eight_round_reveals_and_counts_without_understanding() {
        let start = step(&LiveState::default(), check("Alice"));
        assert!(matches!(start.state.phase, LivePhase::Rating(_)));

        let first = step(&start.state, rate("Alice", 8));
        assert!(matches!(first.state.phase, LivePhase::Waiting(_)));

        let second = step(&first.state, rate("Bob", 8));
        let LivePhase::Revealed(round) = &second.state.phase else {
            panic!("expected reveal, got {:?}", second.state.phase);
        };
        assert_eq!(round.initiator_rating, Some(8));
        assert_eq!(round.responder_rating, Some(8));

        let done = step(&second.state, LiveAction::Acknowledge { by: "Alice".into() });
        assert_eq!(done.state.phase, LivePhase::Idle);
        assert_eq!(done.state.ideas_discussed, 1);
        assert_eq!(done.state.ideas_understood, 0);

        let resolution = done.resolved.unwrap();
        assert_eq!(resolution.round_number, 1);
        assert!(!resolution.understood);
        assert_eq!(resolution.flag, None);
    }

    #[test]
    fn ten_ten_round_counts_as_understood() {
        let state = LiveState {
            ideas_discussed: 4,
            ideas_understood: 2,
            ..LiveState::default()
        };
        let s = step(&state, check("Bob"));
        let s = step(&s.state, rate("Alice", 10));
        let s = step(&s.state, rate("Bob", 10));
        assert!(s.state.is_celebrating());

        let done = step(&s.state, LiveAction::CelebrationComplete);
        assert_eq!(done.state.ideas_discussed, 5);
        assert_eq!(done.state.ideas_understood, 3);
        assert_eq!(done.resolved.unwrap().actor, "Bob");
    }

    #[test]
    fn only_one_side_at_ten_is_not_understood() {
        let done = step(&revealed(10, 9), LiveAction::Skip { by: "Bob".into() });
        assert_eq!(done.state.ideas_understood, 0);
        assert_eq!(done.resolved.unwrap().flag, Some(TurnFlag::Skipped));
    }

    #[test]
    fn cannot_start_while_round_active() {
        let s = step(&LiveState::default(), check("Alice")).state;
        assert_eq!(
            s.apply(&session(), &LiveAction::StartProve { by: "Bob".into() }),
            Err(TransitionError::RoundInProgress)
        );
        assert_eq!(
            revealed(3, 4).apply(&session(), &check("Bob")),
            Err(TransitionError::RoundInProgress)
        );
    }

    #[test]
    fn cannot_start_without_partner() {
        let mut lonely = session();
        lonely.joiner_name = None;
        assert_eq!(
            LiveState::default().apply(&lonely, &check("Alice")),
            Err(TransitionError::NoPartner)
        );
        assert_eq!(
            LiveState::default().apply(&session(), &check("Carol")),
            Err(TransitionError::NotParticipant("Carol".into()))
        );
    }

    #[test]
    fn rating_rules() {
        let s = step(&LiveState::default(), check("Alice")).state;
        assert_eq!(
            s.apply(&session(), &rate("Alice", 11)),
            Err(TransitionError::RatingOutOfRange(11))
        );
        assert_eq!(
            s.apply(&session(), &rate("Carol", 5)),
            Err(TransitionError::NotParticipant("Carol".into()))
        );

        let s = step(&s, rate("Alice", 0)).state;
        assert_eq!(
            s.apply(&session(), &rate("Alice", 3)),
            Err(TransitionError::AlreadySubmitted("Alice".into()))
        );
        assert_eq!(
            LiveState::default().apply(&session(), &rate("Alice", 3)),
            Err(TransitionError::NoActiveRound)
        );
    }

    #[test]
    fn resolving_requires_reveal() {
        let s = step(&LiveState::default(), check("Alice")).state;
        let s = step(&s, rate("Bob", 7)).state;
        assert_eq!(
            s.apply(&session(), &LiveAction::Acknowledge { by: "Alice".into() }),
            Err(TransitionError::NotRevealed)
        );
        assert_eq!(
            revealed(9, 10).apply(&session(), &LiveAction::CelebrationComplete),
            Err(TransitionError::NotCelebration)
        );
    }

    #[test]
    fn exit_goes_idle_and_keeps_counters() {
        let mut s = revealed(5, 5);
        s.ideas_discussed = 2;
        let exited = step(&s, LiveAction::ExitMeeting);
        assert_eq!(exited.state.phase, LivePhase::Idle);
        assert_eq!(exited.state.ideas_discussed, 2);
        assert!(exited.resolved.is_none());
    }

    #[test]
    fn prove_round_records_prover() {
        let s = step(&LiveState::default(), LiveAction::StartProve { by: "Bob".into() }).state;
        let record = s.to_record();
        assert_eq!(record.rating_phase, RatingPhase::Rating);
        assert_eq!(record.checker_name.as_deref(), Some("Bob"));
        assert_eq!(record.prover_name.as_deref(), Some("Bob"));
        assert_eq!(s.round().unwrap().responder, "Alice");

        let back = LiveState::from_record(&record, &session());
        assert_eq!(back, s);
    }

    #[test]
    fn record_with_both_ratings_is_revealed_regardless_of_stored_phase() {
        let record = LiveSessionState {
            rating_phase: RatingPhase::Rating,
            checker_name: Some("Alice".into()),
            checker_rating: Some(6),
            responder_rating: Some(7),
            checker_submitted: true,
            responder_submitted: true,
            ..LiveSessionState::default()
        };
        let state = LiveState::from_record(&record, &session());
        assert!(matches!(state.phase, LivePhase::Revealed(_)));

        // A submitted flag without its rating does not count.
        let half = LiveSessionState {
            rating_phase: RatingPhase::Revealed,
            responder_rating: None,
            ..record
        };
        assert!(matches!(
            LiveState::from_record(&half, &session()).phase,
            LivePhase::Waiting(_)
        ));
    }

    /// Walk every action from every reachable state and check that phases
    /// only move along idle -> rating -> (waiting | revealed) -> idle.
    #[test]
    fn phase_graph_is_closed() {
        let actions = || {
            let mut all = vec![
                check("Alice"),
                check("Bob"),
                LiveAction::StartProve { by: "Alice".into() },
                LiveAction::Acknowledge { by: "Alice".into() },
                LiveAction::Skip { by: "Bob".into() },
                LiveAction::CelebrationComplete,
            ];
            for value in [0, 5, 10] {
                all.push(rate("Alice", value));
                all.push(rate("Bob", value));
            }
            all
        };

        let allowed = |from: RatingPhase, to: RatingPhase| {
            use RatingPhase::*;
            matches!(
                (from, to),
                (Idle, Rating)
                    | (Rating, Waiting)
                    | (Rating, Revealed)
                    | (Waiting, Revealed)
                    | (Revealed, Idle)
            )
        };

        let mut frontier = vec![LiveState::default()];
        let mut seen = Vec::new();
        while let Some(state) = frontier.pop() {
            if seen.contains(&state) || state.ideas_discussed > 2 {
                continue;
            }
            for action in actions() {
                if let Ok(next) = state.apply(&session(), &action) {
                    let (from, to) = (state.phase.rating_phase(), next.state.phase.rating_phase());
                    assert!(allowed(from, to), "{from:?} -> {to:?} via {action:?}");
                    if to == RatingPhase::Revealed {
                        assert!(next.state.round().unwrap().both_submitted());
                    }
                    if let Some(resolution) = &next.resolved {
                        assert_eq!(
                            next.state.ideas_understood - state.ideas_understood,
                            u32::from(resolution.round.is_full_understanding())
                        );
                    }
                    frontier.push(next.state);
                }
            }
            seen.push(state);
        }
        assert!(seen.len() > 10);
    }
}
