pub mod auth;
pub mod hub;
pub mod lifecycle;

pub use auth::MemoryAuthState;
pub use hub::BroadcastHub;
pub use lifecycle::LifecycleBroadcaster;
