pub mod conversation_aggregator;
pub(crate) mod message_log;
pub mod message_pipeline;
pub mod presence_observer;
pub mod presence_tracker;
pub mod read_receipt_batcher;

pub use conversation_aggregator::{ConversationAggregator, ConversationFold, CounterpartSighting};
pub use message_pipeline::{
    DeliveryOutcome, LocalMessageEvent, MessageDeliveryPipeline, SendTicket,
};
pub use presence_observer::PresenceObserver;
pub use presence_tracker::{HeartbeatPresenceTracker, PresencePorts, TrackerPhase};
pub use read_receipt_batcher::{ConversationReadMarker, ReadReceiptBatcher};
