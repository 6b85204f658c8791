use super::message_log::ConversationLog;
use crate::application::ports::{
    ChangeKind, Clock, DocumentChange, DocumentKey, RemoteStatusStore, StoredDocument, WatchTarget,
};
use crate::application::shared::SubscriptionRegistry;
use crate::application::shared::mappers::{
    conversation_query, created_at_of, document_to_message, message_to_document, read_patch,
    unread_for_reader_query,
};
use crate::domain::entities::{ConversationKey, DeliveryStatus, Message, MessageAuthor};
use crate::domain::value_objects::{ConversationId, MessageId};
use crate::shared::config::{AppConfig, MessagingConfig};
use crate::shared::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Message),
    Failed { message_id: MessageId, reason: String },
    /// The message was deleted locally while its write was in flight.
    Discarded { message_id: MessageId },
}

const LOCAL_EVENT_CAPACITY: usize = 256;

/// Local log changes, for views that fold messages outside the per-conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMessageEvent {
    Upserted(Message),
    Removed { client_id: String },
}

/// Returned by `send` and `retry` once the pending message is visible locally.
#[derive(Debug)]
pub struct SendTicket {
    pub message_id: MessageId,
    pub client_id: String,
    completion: JoinHandle<DeliveryOutcome>,
}

impl SendTicket {
    pub async fn outcome(self) -> Result<DeliveryOutcome, AppError> {
        Ok(self.completion.await?)
    }
}

struct PipelineInner {
    store: Arc<dyn RemoteStatusStore>,
    clock: Arc<dyn Clock>,
    config: MessagingConfig,
    collection: String,
    logs: Mutex<HashMap<ConversationId, ConversationLog>>,
    attached: Mutex<HashSet<ConversationId>>,
    subscriptions: SubscriptionRegistry,
    local_events: broadcast::Sender<LocalMessageEvent>,
}

/// Optimistic send/retry/delete over the message collection.
///
/// Every mutation lands in the conversation's local log before any I/O; the log is then
/// reconciled with the store's answer and with remote snapshots once attached.
#[derive(Clone)]
pub struct MessageDeliveryPipeline {
    inner: Arc<PipelineInner>,
}

impl MessageDeliveryPipeline {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RemoteStatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                store,
                clock,
                config: config.messaging.clone(),
                collection: config.store.messages_collection.clone(),
                logs: Mutex::new(HashMap::new()),
                attached: Mutex::new(HashSet::new()),
                subscriptions: SubscriptionRegistry::new(),
                local_events: broadcast::channel(LOCAL_EVENT_CAPACITY).0,
            }),
        }
    }

    pub fn send(
        &self,
        conversation: &ConversationKey,
        content: &str,
        sender: &MessageAuthor,
    ) -> Result<SendTicket, AppError> {
        let content = self.validate_content(content)?;
        let message = Message::new_pending(conversation, sender, content, self.inner.clock.now());
        let message_id = message.id.clone();
        let client_id = message.client_id.clone();

        self.inner
            .lock_logs()
            .entry(conversation.id.clone())
            .or_default()
            .append_local(message.clone());
        self.inner.emit(LocalMessageEvent::Upserted(message));
        debug!(
            conversation_id = %conversation.id,
            message_id = %message_id,
            "message queued"
        );

        let inner = self.inner.clone();
        let conversation_id = conversation.id.clone();
        let persist_client_id = client_id.clone();
        let completion =
            tokio::spawn(async move { inner.persist(conversation_id, persist_client_id).await });

        Ok(SendTicket {
            message_id,
            client_id,
            completion,
        })
    }

    /// Re-sends a failed message with its original content and sender. Anything else is rejected.
    pub fn retry(&self, message_id: &MessageId) -> Result<SendTicket, AppError> {
        let (conversation_id, client_id, current_id) = {
            let mut logs = self.inner.lock_logs();
            let (conversation_id, log) = logs
                .iter_mut()
                .find(|(_, log)| log.find(message_id).is_some())
                .ok_or_else(|| AppError::NotFound(format!("Message {message_id} not found")))?;
            let (client_id, status, current_id) = match log.find(message_id) {
                Some(message) => (message.client_id.clone(), message.status, message.id.clone()),
                None => return Err(AppError::NotFound(format!("Message {message_id} not found"))),
            };
            if status != DeliveryStatus::Failed {
                return Err(AppError::InvalidState(format!(
                    "Only failed messages can be retried; {message_id} is {}",
                    status.as_str()
                )));
            }
            let pending = log
                .update(&client_id, |message| {
                    message.last_error = None;
                    message.transition(DeliveryStatus::Pending)?;
                    Ok(message.clone())
                })
                .transpose()
                .map_err(AppError::InvalidState)?;
            if let Some(pending) = pending {
                self.inner.emit(LocalMessageEvent::Upserted(pending));
            }
            (conversation_id.clone(), client_id, current_id)
        };
        info!(conversation_id = %conversation_id, message_id = %current_id, "retrying message");

        let inner = self.inner.clone();
        let persist_client_id = client_id.clone();
        let completion =
            tokio::spawn(async move { inner.persist(conversation_id, persist_client_id).await });
        Ok(SendTicket {
            message_id: current_id,
            client_id,
            completion,
        })
    }

    /// Removes the message locally, then remotely when it has a store id. Local removal is
    /// not rolled back when the remote delete fails.
    pub async fn delete(&self, message_id: &MessageId) -> Result<(), AppError> {
        let (conversation_id, removed) = {
            let mut logs = self.inner.lock_logs();
            let found = logs.iter_mut().find_map(|(conversation_id, log)| {
                log.remove(message_id)
                    .map(|removed| (conversation_id.clone(), removed))
            });
            found.ok_or_else(|| AppError::NotFound(format!("Message {message_id} not found")))?
        };
        self.inner.emit(LocalMessageEvent::Removed {
            client_id: removed.client_id.clone(),
        });

        if removed.status != DeliveryStatus::Delivered || removed.id.is_local() {
            debug!(
                conversation_id = %conversation_id,
                message_id = %removed.id,
                status = removed.status.as_str(),
                "removed undelivered message locally"
            );
            return Ok(());
        }

        let key = DocumentKey::new(self.inner.collection.clone(), removed.id.as_str());
        if let Err(err) = self.inner.store.delete(&key).await {
            error!(
                conversation_id = %conversation_id,
                message_id = %removed.id,
                error = %err,
                "remote delete failed"
            );
            if let Some(log) = self.inner.lock_logs().get_mut(&conversation_id) {
                log.lift_tombstone(&removed);
            }
            self.inner.emit(LocalMessageEvent::Upserted(removed));
            return Err(err);
        }
        info!(conversation_id = %conversation_id, message_id = %removed.id, "message deleted");
        Ok(())
    }

    /// Every local send, retry, delivery, failure and delete, in the order they happen.
    pub fn local_events(&self) -> broadcast::Receiver<LocalMessageEvent> {
        self.inner.local_events.subscribe()
    }

    pub fn messages_of(&self, conversation_id: &ConversationId) -> watch::Receiver<Vec<Message>> {
        self.inner
            .lock_logs()
            .entry(conversation_id.clone())
            .or_default()
            .subscribe()
    }

    pub fn find(&self, message_id: &MessageId) -> Option<Message> {
        self.inner
            .lock_logs()
            .values()
            .find_map(|log| log.find(message_id).cloned())
    }

    /// Current ordered contents of the local log.
    pub fn snapshot_of(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock_logs()
            .get(conversation_id)
            .map(ConversationLog::ordered)
            .unwrap_or_default()
    }

    /// Merges the store's view of the conversation into the local log. Idempotent.
    pub async fn attach(&self, conversation_id: &ConversationId) -> Result<(), AppError> {
        if !self.inner.lock_attached().insert(conversation_id.clone()) {
            return Ok(());
        }

        let query = conversation_query(&self.inner.collection, conversation_id);
        let subscription = match self.inner.store.subscribe(WatchTarget::Query(query)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.lock_attached().remove(conversation_id);
                return Err(err);
            }
        };

        let (handle, mut updates) = subscription.into_parts();
        let weak = Arc::downgrade(&self.inner);
        let pump_conversation = conversation_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(snapshot) = updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.merge_snapshot(&pump_conversation, snapshot.changes);
            }
        });
        self.inner
            .subscriptions
            .register(format!("conversation:{conversation_id}"), handle, Some(pump));
        debug!(conversation_id = %conversation_id, "conversation attached");
        Ok(())
    }

    /// Stops every remote feed and forgets the local logs.
    pub fn detach_all(&self) {
        let disposed = self.inner.subscriptions.dispose_all();
        self.inner.lock_attached().clear();
        self.inner.lock_logs().clear();
        debug!(disposed, "message feeds detached");
    }

    /// Marks every unread message addressed to `reader_id` as read in atomic batches.
    /// Returns how many messages changed; zero means no write was issued.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, AppError> {
        let query = unread_for_reader_query(&self.inner.collection, conversation_id, reader_id);
        let unread: Vec<StoredDocument> = self
            .inner
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter(|doc| {
                doc.data.get("senderId").and_then(serde_json::Value::as_str) != Some(reader_id)
            })
            .collect();

        if unread.is_empty() {
            debug!(conversation_id = %conversation_id, reader_id = %reader_id, "nothing to mark read");
            return Ok(0);
        }

        let read_at = self.inner.clock.now();
        let chunk_size = self.inner.config.read_batch_limit.max(1);
        let mut committed = HashSet::new();
        for chunk in unread.chunks(chunk_size) {
            let updates: Vec<(DocumentKey, _)> = chunk
                .iter()
                .map(|doc| (doc.key.clone(), read_patch(read_at)))
                .collect();
            if let Err(err) = self.inner.store.batch_update(updates).await {
                warn!(
                    conversation_id = %conversation_id,
                    reader_id = %reader_id,
                    committed = committed.len(),
                    error = %err,
                    "read batch failed"
                );
                self.inner.apply_read(conversation_id, &committed);
                return Err(err);
            }
            committed.extend(chunk.iter().map(|doc| doc.key.id.clone()));
        }

        self.inner.apply_read(conversation_id, &committed);
        info!(
            conversation_id = %conversation_id,
            reader_id = %reader_id,
            count = committed.len(),
            "conversation marked read"
        );
        Ok(committed.len())
    }

    fn validate_content(&self, content: &str) -> Result<String, AppError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(AppError::ValidationError(
                "Message content must not be empty".to_string(),
            ));
        }
        let length = trimmed.chars().count();
        if length > self.inner.config.max_content_length {
            return Err(AppError::ValidationError(format!(
                "Message content is {length} characters; the limit is {}",
                self.inner.config.max_content_length
            )));
        }
        Ok(trimmed.to_string())
    }
}

impl PipelineInner {
    fn lock_logs(&self) -> MutexGuard<'_, HashMap<ConversationId, ConversationLog>> {
        match self.logs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: LocalMessageEvent) {
        // no follower is fine; the per-conversation logs stay authoritative
        let _ = self.local_events.send(event);
    }

    fn lock_attached(&self) -> MutexGuard<'_, HashSet<ConversationId>> {
        match self.attached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn persist(
        self: Arc<Self>,
        conversation_id: ConversationId,
        client_id: String,
    ) -> DeliveryOutcome {
        let message = {
            let logs = self.lock_logs();
            logs.get(&conversation_id)
                .and_then(|log| log.find_by_client_id(&client_id))
                .cloned()
        };
        let Some(message) = message else {
            debug!(conversation_id = %conversation_id, client_id = %client_id, "message gone before persist");
            return DeliveryOutcome::Discarded {
                message_id: MessageId::from(client_id),
            };
        };

        let write = self
            .store
            .create(&self.collection, message_to_document(&message));
        let result = match tokio::time::timeout(self.config.send_timeout(), write).await {
            Ok(result) => result,
            Err(elapsed) => Err(AppError::from(elapsed)),
        };

        match result {
            Ok(stored) => self.complete_delivery(&conversation_id, &message, stored).await,
            Err(err) => self.complete_failure(&conversation_id, &message, err),
        }
    }

    async fn complete_delivery(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
        stored: StoredDocument,
    ) -> DeliveryOutcome {
        let remote_id = MessageId::remote(stored.key.id.clone());
        let created_at = created_at_of(&stored).unwrap_or_else(|| self.clock.now());

        let outcome = {
            let mut logs = self.lock_logs();
            let log = logs.get_mut(conversation_id);
            match log {
                Some(log) if log.find_by_client_id(&message.client_id).is_some() => log
                    .update(&message.client_id, |local| {
                        if local.status == DeliveryStatus::Pending {
                            if let Err(reason) = local.mark_delivered(remote_id.clone(), created_at) {
                                warn!(message_id = %local.id, %reason, "delivery transition rejected");
                            }
                        }
                        local.clone()
                    })
                    .map(DeliveryOutcome::Delivered),
                Some(log) if log.is_client_id_tombstoned(&message.client_id) => None,
                _ => Some(DeliveryOutcome::Delivered(
                    document_to_message(&stored).unwrap_or_else(|_| {
                        let mut fallback = message.clone();
                        fallback.status = DeliveryStatus::Delivered;
                        fallback.id = remote_id.clone();
                        fallback.created_at = Some(created_at);
                        fallback
                    }),
                )),
            }
        };

        match outcome {
            Some(outcome) => {
                info!(conversation_id = %conversation_id, message_id = %remote_id, "message delivered");
                if let DeliveryOutcome::Delivered(message) = &outcome {
                    self.emit(LocalMessageEvent::Upserted(message.clone()));
                }
                outcome
            }
            None => {
                info!(conversation_id = %conversation_id, message_id = %remote_id, "deleted during send, removing remote copy");
                if let Err(err) = self.store.delete(&stored.key).await {
                    error!(message_id = %remote_id, error = %err, "remote cleanup of deleted message failed");
                }
                DeliveryOutcome::Discarded {
                    message_id: remote_id,
                }
            }
        }
    }

    fn complete_failure(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
        err: AppError,
    ) -> DeliveryOutcome {
        let reason = err.to_string();
        let mut logs = self.lock_logs();
        let updated = logs.get_mut(conversation_id).and_then(|log| {
            log.update(&message.client_id, |local| {
                if local.status == DeliveryStatus::Pending {
                    if let Err(rejected) = local.mark_failed(reason.clone()) {
                        warn!(message_id = %local.id, reason = %rejected, "failure transition rejected");
                    }
                }
                local.clone()
            })
        });

        match updated {
            Some(local) if local.status == DeliveryStatus::Delivered => {
                DeliveryOutcome::Delivered(local)
            }
            Some(local) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %local.id,
                    error = %err,
                    "message send failed"
                );
                self.emit(LocalMessageEvent::Upserted(local.clone()));
                DeliveryOutcome::Failed {
                    message_id: local.id,
                    reason,
                }
            }
            None => DeliveryOutcome::Discarded {
                message_id: message.id.clone(),
            },
        }
    }

    fn merge_snapshot(&self, conversation_id: &ConversationId, changes: Vec<DocumentChange>) {
        let mut logs = self.lock_logs();
        let log = logs.entry(conversation_id.clone()).or_default();
        for change in changes {
            let remote = match document_to_message(&change.document) {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(conversation_id = %conversation_id, error = %err, "skipping malformed message");
                    continue;
                }
            };
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    log.merge_remote(remote);
                }
                ChangeKind::Removed => log.remove_remote(&remote),
            }
        }
        log.publish();
    }

    fn apply_read(&self, conversation_id: &ConversationId, remote_ids: &HashSet<String>) {
        if remote_ids.is_empty() {
            return;
        }
        if let Some(log) = self.lock_logs().get_mut(conversation_id) {
            log.mark_read(remote_ids);
        }
    }
}

#[cfg(test)]
mod tests;
