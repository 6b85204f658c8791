pub mod entities;
pub mod value_objects;

pub use entities::{
    ConversationKey, ConversationSummary, DeliveryStatus, Message, MessageAuthor, PresenceRecord,
    PresenceStatus, PresenceView,
};
pub use value_objects::{AppLifecycleState, ConversationId, MessageId, PresenceRole};
