pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::ConversationSummary;
pub use message::{ConversationKey, DeliveryStatus, Message, MessageAuthor};
pub use presence::{PresenceRecord, PresenceStatus, PresenceView};
