pub mod hub;
pub mod subscription;

pub use hub::RealtimeHub;
pub use subscription::Subscription;
