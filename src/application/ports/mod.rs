pub mod session_events;
pub mod status_store;
pub mod subscription;
pub mod timer;

pub use session_events::{AppLifecycleSource, AuthState};
pub use status_store::{
    ChangeKind, Document, DocumentChange, DocumentKey, FieldFilter, RemoteStatusStore,
    StoreQuery, StoreSnapshot, StoredDocument, WatchTarget,
};
pub use subscription::{Subscription, SubscriptionHandle};
pub use timer::{Clock, SystemClock, TimerCallback, TimerHandle, TimerScheduler};
