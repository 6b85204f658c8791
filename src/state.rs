use crate::application::ports::{
    AppLifecycleSource, AuthState, Clock, RemoteStatusStore, TimerScheduler,
};
use crate::application::services::{
    ConversationAggregator, HeartbeatPresenceTracker, MessageDeliveryPipeline, PresenceObserver,
    PresencePorts, ReadReceiptBatcher, SendTicket,
};
use crate::domain::entities::{
    ConversationKey, ConversationSummary, Message, MessageAuthor, PresenceView,
};
use crate::domain::value_objects::{ConversationId, MessageId, PresenceRole};
use crate::shared::config::AppConfig;
use crate::shared::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

/// Ports shared by every service of a session.
#[derive(Clone)]
pub struct SessionPorts {
    pub store: Arc<dyn RemoteStatusStore>,
    pub auth: Arc<dyn AuthState>,
    pub lifecycle: Arc<dyn AppLifecycleSource>,
    pub timers: Arc<dyn TimerScheduler>,
    pub clock: Arc<dyn Clock>,
}

impl SessionPorts {
    fn presence_ports(&self) -> PresencePorts {
        PresencePorts {
            store: self.store.clone(),
            auth: self.auth.clone(),
            lifecycle: self.lifecycle.clone(),
            timers: self.timers.clone(),
            clock: self.clock.clone(),
        }
    }
}

type TrackerKey = (String, PresenceRole);

/// セッション単位の状態。UI 層にはグローバルではなくこの構造体を渡す
pub struct SessionContext {
    config: AppConfig,
    ports: SessionPorts,
    trackers: Mutex<HashMap<TrackerKey, Arc<HeartbeatPresenceTracker>>>,
    observer: PresenceObserver,
    pipeline: MessageDeliveryPipeline,
    batcher: ReadReceiptBatcher,
    aggregator: RwLock<Option<Arc<ConversationAggregator>>>,
}

impl SessionContext {
    pub fn new(config: AppConfig, ports: SessionPorts) -> Result<Self, AppError> {
        config.validate().map_err(AppError::ConfigurationError)?;

        let observer = PresenceObserver::new(
            &config,
            ports.store.clone(),
            ports.timers.clone(),
            ports.clock.clone(),
        );
        let pipeline =
            MessageDeliveryPipeline::new(&config, ports.store.clone(), ports.clock.clone());
        let batcher = ReadReceiptBatcher::new(Arc::new(pipeline.clone()));

        Ok(Self {
            config,
            ports,
            trackers: Mutex::new(HashMap::new()),
            observer,
            pipeline,
            batcher,
            aggregator: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &MessageDeliveryPipeline {
        &self.pipeline
    }

    /// The single tracker for (owner, role), created on first use.
    pub fn tracker(&self, owner_id: &str, role: PresenceRole) -> Arc<HeartbeatPresenceTracker> {
        self.lock_trackers()
            .entry((owner_id.to_string(), role))
            .or_insert_with(|| {
                Arc::new(HeartbeatPresenceTracker::new(
                    owner_id,
                    role,
                    &self.config,
                    self.ports.presence_ports(),
                ))
            })
            .clone()
    }

    pub async fn login(
        &self,
        owner_id: &str,
        role: PresenceRole,
    ) -> Result<Arc<HeartbeatPresenceTracker>, AppError> {
        let tracker = self.tracker(owner_id, role);
        tracker.initialize().await?;

        let mut slot = self.aggregator.write().await;
        let needs_aggregator = slot
            .as_ref()
            .map(|current| current.viewer_id() != owner_id)
            .unwrap_or(true);
        if needs_aggregator {
            if let Some(previous) = slot.take() {
                previous.stop();
            }
            let aggregator = Arc::new(ConversationAggregator::new(
                owner_id,
                &self.config,
                self.ports.store.clone(),
            ));
            aggregator.follow_local(self.pipeline.local_events());
            *slot = Some(aggregator);
        }
        if let Some(aggregator) = slot.as_ref() {
            if let Err(err) = aggregator.start().await {
                warn!(owner_id = %owner_id, error = %err, "conversation feed unavailable");
            }
        }

        info!(owner_id = %owner_id, role = %role, "session logged in");
        Ok(tracker)
    }

    /// Takes every tracker offline and releases all live feeds.
    pub async fn logout(&self) {
        let trackers: Vec<Arc<HeartbeatPresenceTracker>> =
            self.lock_trackers().drain().map(|(_, tracker)| tracker).collect();
        for tracker in &trackers {
            tracker.cleanup().await;
        }

        self.pipeline.detach_all();
        self.batcher.close_all();
        if let Some(aggregator) = self.aggregator.write().await.take() {
            aggregator.stop();
        }
        self.observer.dispose();
        info!(trackers = trackers.len(), "session logged out");
    }

    pub async fn presence_of(
        &self,
        owner_id: &str,
        role: PresenceRole,
    ) -> watch::Receiver<PresenceView> {
        self.observer.presence_of(owner_id, role).await
    }

    pub async fn conversation_list(
        &self,
    ) -> Result<watch::Receiver<Vec<ConversationSummary>>, AppError> {
        self.aggregator
            .read()
            .await
            .as_ref()
            .map(|aggregator| aggregator.conversation_list())
            .ok_or_else(|| AppError::InvalidState("No user is logged in".to_string()))
    }

    pub async fn messages_of(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<watch::Receiver<Vec<Message>>, AppError> {
        self.pipeline.attach(conversation_id).await?;
        Ok(self.pipeline.messages_of(conversation_id))
    }

    pub async fn send(
        &self,
        conversation: &ConversationKey,
        content: &str,
        sender: &MessageAuthor,
    ) -> Result<SendTicket, AppError> {
        self.pipeline.send(conversation, content, sender)
    }

    pub fn retry(&self, message_id: &MessageId) -> Result<SendTicket, AppError> {
        self.pipeline.retry(message_id)
    }

    pub async fn delete(&self, message_id: &MessageId) -> Result<(), AppError> {
        self.pipeline.delete(message_id).await
    }

    /// Attaches the conversation feed and clears its unread count once per open.
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, AppError> {
        self.pipeline.attach(conversation_id).await?;
        self.batcher
            .on_conversation_opened(conversation_id, reader_id)
            .await
    }

    pub fn close_conversation(&self, conversation_id: &ConversationId, reader_id: &str) {
        self.batcher.on_conversation_closed(conversation_id, reader_id);
    }

    fn lock_trackers(&self) -> MutexGuard<'_, HashMap<TrackerKey, Arc<HeartbeatPresenceTracker>>> {
        match self.trackers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
