pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod shared;
pub mod state;

pub use application::ports::{
    AppLifecycleSource, AuthState, Clock, RemoteStatusStore, SystemClock, TimerScheduler,
};
pub use application::services::{
    ConversationAggregator, DeliveryOutcome, HeartbeatPresenceTracker, LocalMessageEvent,
    MessageDeliveryPipeline, PresenceObserver, PresencePorts, ReadReceiptBatcher, SendTicket,
    TrackerPhase,
};
pub use domain::{
    AppLifecycleState, ConversationId, ConversationKey, ConversationSummary, DeliveryStatus,
    Message, MessageAuthor, MessageId, PresenceRole, PresenceStatus, PresenceView,
};
pub use infrastructure::session::{LifecycleBroadcaster, MemoryAuthState};
pub use infrastructure::store::MemoryStatusStore;
pub use infrastructure::timer::{TokioTimerScheduler, VirtualTimerScheduler};
pub use shared::{AppConfig, AppError, Result};
pub use state::{SessionContext, SessionPorts};

/// Installs the fmt subscriber. `PORTAL_SYNC_LOG` wins over `RUST_LOG`.
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_env("PORTAL_SYNC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "portal_sync=debug,info".into());

    // a second call (tests, embedding apps) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
