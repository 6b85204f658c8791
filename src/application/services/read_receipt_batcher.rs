use super::message_pipeline::MessageDeliveryPipeline;
use crate::domain::value_objects::ConversationId;
use crate::shared::error::AppError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[async_trait]
pub trait ConversationReadMarker: Send + Sync {
    async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, AppError>;
}

#[async_trait]
impl ConversationReadMarker for MessageDeliveryPipeline {
    async fn mark_conversation_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, AppError> {
        MessageDeliveryPipeline::mark_conversation_read(self, conversation_id, reader_id).await
    }
}

/// Marks a conversation read once per open. Re-opening without closing first is a no-op.
pub struct ReadReceiptBatcher {
    marker: Arc<dyn ConversationReadMarker>,
    open: Mutex<HashSet<(ConversationId, String)>>,
}

impl ReadReceiptBatcher {
    pub fn new(marker: Arc<dyn ConversationReadMarker>) -> Self {
        Self {
            marker,
            open: Mutex::new(HashSet::new()),
        }
    }

    pub async fn on_conversation_opened(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, AppError> {
        let entry = (conversation_id.clone(), reader_id.to_string());
        if !self.lock().insert(entry.clone()) {
            debug!(conversation_id = %conversation_id, reader_id = %reader_id, "conversation already open");
            return Ok(0);
        }

        match self.marker.mark_conversation_read(conversation_id, reader_id).await {
            Ok(count) => Ok(count),
            Err(err) => {
                // let the next open try again
                self.lock().remove(&entry);
                Err(err)
            }
        }
    }

    pub fn on_conversation_closed(&self, conversation_id: &ConversationId, reader_id: &str) {
        self.lock()
            .remove(&(conversation_id.clone(), reader_id.to_string()));
    }

    pub fn is_open(&self, conversation_id: &ConversationId, reader_id: &str) -> bool {
        self.lock()
            .contains(&(conversation_id.clone(), reader_id.to_string()))
    }

    pub fn close_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(ConversationId, String)>> {
        match self.open.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
