pub mod live_state;
pub mod session;
pub mod turn;

pub use live_state::{LiveSessionState, LiveStatePatch, RatingPhase, MAX_RATING};
pub use session::{ClaritySession, SessionSnapshot};
pub use turn::{LiveTurn, TurnFlag};
