//! Screen selection for one participant's view of a live meeting.

use std::fmt;

use serde::Serialize;

use crate::db::ClaritySession;

use super::state::{LivePhase, LiveState, Round, RoundDirection, Side};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "screen")]
pub enum LiveScreen {
    AwaitingPartner {
        session_id: String,
    },
    Idle {
        partner: String,
        ideas_discussed: u32,
        ideas_understood: u32,
    },
    Rating {
        title: String,
        question: String,
    },
    Waiting {
        partner: String,
        my_rating: u8,
    },
    Revealed {
        partner: String,
        my_rating: u8,
        partner_rating: u8,
    },
    Celebration {
        partner: String,
    },
    Ended,
    Exited,
}

/// Heading shown while a round is open.
pub fn round_title(round: &Round) -> String {
    match round.direction {
        RoundDirection::Checking => format!("{} asks: Did you get it?", round.initiator),
        RoundDirection::Proving => format!("{} asks: Did I get it?", round.initiator),
    }
}

/// The rating question for `me`. Both sides fill the same two numbers; what
/// the number means depends on who is proving understanding.
pub fn rating_question(round: &Round, me: &str) -> String {
    let partner = round.partner_of(me).unwrap_or("your partner");
    let is_prover = match (round.direction, round.side_of(me)) {
        (RoundDirection::Proving, Some(Side::Initiator)) => true,
        (RoundDirection::Checking, Some(Side::Responder)) => true,
        _ => false,
    };

    if is_prover {
        format!("How confident are you that you understand {partner}?")
    } else {
        format!("How well do you feel understood by {partner}?")
    }
}

pub fn render(session: &ClaritySession, live: &LiveState, me: &str, exited: bool) -> LiveScreen {
    if exited {
        return LiveScreen::Exited;
    }
    if session.is_ended() {
        return LiveScreen::Ended;
    }
    let Some(partner) = session.partner_of(me) else {
        return LiveScreen::AwaitingPartner {
            session_id: session.id.clone(),
        };
    };
    let partner = partner.to_string();

    match &live.phase {
        LivePhase::Idle => LiveScreen::Idle {
            partner,
            ideas_discussed: live.ideas_discussed,
            ideas_understood: live.ideas_understood,
        },
        LivePhase::Rating(round) | LivePhase::Waiting(round) => match round.rating_of(me) {
            Some(my_rating) => LiveScreen::Waiting { partner, my_rating },
            None => LiveScreen::Rating {
                title: round_title(round),
                question: rating_question(round, me),
            },
        },
        LivePhase::Revealed(round) if round.is_full_understanding() => {
            LiveScreen::Celebration { partner }
        }
        LivePhase::Revealed(round) => LiveScreen::Revealed {
            partner,
            my_rating: round.rating_of(me).unwrap_or_default(),
            partner_rating: round
                .partner_of(me)
                .and_then(|name| round.rating_of(name))
                .unwrap_or_default(),
        },
    }
}

impl fmt::Display for LiveScreen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveScreen::AwaitingPartner { session_id } => {
                writeln!(f, "Waiting for your partner to join.")?;
                write!(f, "Share this meeting id: {session_id}")
            }
            LiveScreen::Idle {
                partner,
                ideas_discussed,
                ideas_understood,
            } => {
                writeln!(f, "In a meeting with {partner}.")?;
                if *ideas_discussed > 0 {
                    writeln!(f, "Ideas understood: {ideas_understood}/{ideas_discussed}")?;
                }
                write!(f, "[check] Did you get it?   [prove] Did I get it?")
            }
            LiveScreen::Rating { title, question } => {
                writeln!(f, "{title}")?;
                write!(f, "{question} (0-10)")
            }
            LiveScreen::Waiting { partner, my_rating } => {
                write!(f, "You rated {my_rating}. Waiting for {partner}...")
            }
            LiveScreen::Revealed {
                partner,
                my_rating,
                partner_rating,
            } => {
                writeln!(f, "You: {my_rating}   {partner}: {partner_rating}")?;
                write!(f, "[ok] Good enough   [skip] Skip   [flag] Flag a misunderstanding")
            }
            LiveScreen::Celebration { partner } => {
                write!(f, "10 and 10! You and {partner} got it.")
            }
            LiveScreen::Ended => write!(f, "This meeting has ended."),
            LiveScreen::Exited => write!(f, "You left the meeting."),
        }
    }
}
