pub mod commands;
pub mod controller;
pub mod state;
pub mod view;

pub use controller::{LiveSessionController, MeetingView, DEFAULT_CELEBRATION_DELAY};
pub use state::{
    LiveAction, LivePhase, LiveState, Resolution, Round, RoundDirection, Side, Transition,
    TransitionError,
};
pub use view::{rating_question, render, LiveScreen};
