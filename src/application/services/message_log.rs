use crate::domain::entities::{DeliveryStatus, Message};
use crate::domain::value_objects::MessageId;
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    message: Message,
}

/// Local, optimistically mutated view of one conversation.
///
/// Delivered messages are ordered by server timestamp (ties by insertion), followed by
/// pending and failed messages in insertion order. Deleted ids are tombstoned so a late
/// remote snapshot cannot resurrect them.
pub(crate) struct ConversationLog {
    entries: Vec<LogEntry>,
    next_seq: u64,
    tombstones: HashSet<String>,
    tx: watch::Sender<Vec<Message>>,
}

impl Default for ConversationLog {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            entries: Vec::new(),
            next_seq: 0,
            tombstones: HashSet::new(),
            tx,
        }
    }
}

impl ConversationLog {
    pub(crate) fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.tx.subscribe()
    }

    pub(crate) fn append_local(&mut self, message: Message) {
        self.push(message);
        self.publish();
    }

    pub(crate) fn find(&self, id: &MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .map(|entry| &entry.message)
            .find(|message| message.matches_id(id))
    }

    pub(crate) fn find_by_client_id(&self, client_id: &str) -> Option<&Message> {
        self.entries
            .iter()
            .map(|entry| &entry.message)
            .find(|message| message.client_id == client_id)
    }

    /// Applies `update` to the message with the given client id and republishes on success.
    pub(crate) fn update<T>(
        &mut self,
        client_id: &str,
        update: impl FnOnce(&mut Message) -> T,
    ) -> Option<T> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.message.client_id == client_id)?;
        let result = update(&mut entry.message);
        self.publish();
        Some(result)
    }

    pub(crate) fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.message.matches_id(id))?;
        let removed = self.entries.remove(index).message;
        self.tombstones.insert(removed.client_id.clone());
        self.tombstones.insert(removed.id.as_str().to_string());
        self.publish();
        Some(removed)
    }

    pub(crate) fn is_tombstoned(&self, message: &Message) -> bool {
        self.tombstones.contains(&message.client_id)
            || self.tombstones.contains(message.id.as_str())
    }

    pub(crate) fn is_client_id_tombstoned(&self, client_id: &str) -> bool {
        self.tombstones.contains(client_id)
    }

    /// Lets the next remote snapshot carrying the message reconcile it back.
    pub(crate) fn lift_tombstone(&mut self, message: &Message) {
        self.tombstones.remove(&message.client_id);
        self.tombstones.remove(message.id.as_str());
    }

    /// Folds a delivered message read back from the store. Returns false when ignored.
    pub(crate) fn merge_remote(&mut self, remote: Message) -> bool {
        if self.is_tombstoned(&remote) {
            debug!(message_id = %remote.id, "ignoring tombstoned message");
            return false;
        }

        let existing = self
            .entries
            .iter_mut()
            .find(|entry| {
                entry.message.client_id == remote.client_id || entry.message.id == remote.id
            });
        match existing {
            Some(entry) => reconcile(&mut entry.message, remote),
            None => self.push(remote),
        }
        true
    }

    /// Drops a message the store reports as removed. Its tombstone has served its purpose.
    pub(crate) fn remove_remote(&mut self, remote: &Message) {
        self.entries.retain(|entry| {
            entry.message.client_id != remote.client_id && entry.message.id != remote.id
        });
        self.lift_tombstone(remote);
    }

    pub(crate) fn mark_read(&mut self, remote_ids: &HashSet<String>) {
        let mut changed = false;
        for entry in &mut self.entries {
            if !entry.message.read && remote_ids.contains(entry.message.id.as_str()) {
                entry.message.read = true;
                changed = true;
            }
        }
        if changed {
            self.publish();
        }
    }

    pub(crate) fn publish(&self) {
        self.tx.send_replace(self.ordered());
    }

    pub(crate) fn ordered(&self) -> Vec<Message> {
        let mut delivered: Vec<&LogEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.message.status == DeliveryStatus::Delivered)
            .collect();
        delivered.sort_by_key(|entry| (entry.message.effective_timestamp(), entry.seq));

        let mut outstanding: Vec<&LogEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.message.status != DeliveryStatus::Delivered)
            .collect();
        outstanding.sort_by_key(|entry| entry.seq);

        delivered
            .into_iter()
            .chain(outstanding)
            .map(|entry| entry.message.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, message: Message) {
        self.next_seq += 1;
        self.entries.push(LogEntry {
            seq: self.next_seq,
            message,
        });
    }
}

/// Local state never moves backwards: a failed entry the store already holds is walked
/// through pending to delivered, and delivered entries only take the remote fields.
fn reconcile(local: &mut Message, remote: Message) {
    if local.status == DeliveryStatus::Failed {
        if let Err(reason) = local.transition(DeliveryStatus::Pending) {
            warn!(message_id = %local.id, %reason, "reconcile transition rejected");
        }
    }
    if local.status == DeliveryStatus::Pending {
        let created_at = remote.effective_timestamp();
        if let Err(reason) = local.mark_delivered(remote.id.clone(), created_at) {
            warn!(message_id = %local.id, %reason, "reconcile transition rejected");
        }
    }
    local.id = remote.id;
    local.created_at = remote.created_at.or(local.created_at);
    local.read = local.read || remote.read;
    local.content = remote.content;
    local.participants = remote.participants;
    if remote.sender_name.is_some() {
        local.sender_name = remote.sender_name;
    }
}
