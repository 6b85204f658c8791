pub mod ids;
pub mod role;

pub use ids::{ConversationId, MessageId};
pub use role::{AppLifecycleState, PresenceRole};
