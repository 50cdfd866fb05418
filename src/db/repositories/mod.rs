mod live_state;
pub(crate) mod sessions;
mod turns;
