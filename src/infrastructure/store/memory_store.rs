use crate::application::ports::{
    ChangeKind, Clock, Document, DocumentChange, DocumentKey, RemoteStatusStore, StoreQuery,
    StoreSnapshot, StoredDocument, Subscription, SubscriptionHandle, WatchTarget,
};
use crate::shared::error::AppError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Create,
    Delete,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub op: WriteOp,
    pub keys: Vec<DocumentKey>,
}

#[derive(Default)]
struct FaultPlan {
    unavailable: bool,
    fail_next_writes: u32,
    fail_reads: bool,
}

struct Watcher {
    id: u64,
    target: WatchTarget,
    tx: mpsc::UnboundedSender<StoreSnapshot>,
}

impl Watcher {
    fn wants(&self, key: &DocumentKey, data: &Document) -> bool {
        match &self.target {
            WatchTarget::Document(watched) => watched == key,
            WatchTarget::Query(query) => query.matches(key, data),
        }
    }
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
    next_document_id: u64,
    write_log: Vec<WriteEntry>,
    faults: FaultPlan,
}

impl StoreState {
    fn document(&self, key: &DocumentKey) -> Option<&Document> {
        self.collections.get(&key.collection)?.get(&key.id)
    }

    fn check_write(&mut self) -> Result<(), AppError> {
        if self.faults.unavailable {
            return Err(AppError::StoreWrite("store unavailable".to_string()));
        }
        if self.faults.fail_next_writes > 0 {
            self.faults.fail_next_writes -= 1;
            return Err(AppError::StoreWrite("injected write failure".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), AppError> {
        if self.faults.unavailable || self.faults.fail_reads {
            return Err(AppError::StoreRead("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Applies a write and returns the (before, after) pair for change fan-out.
    fn put(
        &mut self,
        key: &DocumentKey,
        patch: Document,
        merge: bool,
    ) -> (Option<Document>, Option<Document>) {
        let collection = self.collections.entry(key.collection.clone()).or_default();
        let before = collection.get(&key.id).cloned();
        let after = match (&before, merge) {
            (Some(existing), true) => {
                let mut merged = existing.clone();
                for (field, value) in patch {
                    merged.insert(field, value);
                }
                merged
            }
            _ => patch,
        };
        collection.insert(key.id.clone(), after.clone());
        (before, Some(after))
    }

    fn remove(&mut self, key: &DocumentKey) -> (Option<Document>, Option<Document>) {
        let before = self
            .collections
            .get_mut(&key.collection)
            .and_then(|collection| collection.remove(&key.id));
        (before, None)
    }

    fn fan_out(&mut self, mutations: &[(DocumentKey, Option<Document>, Option<Document>)]) {
        self.watchers.retain(|watcher| {
            let mut snapshot = StoreSnapshot::default();
            for (key, before, after) in mutations {
                let was = before.as_ref().is_some_and(|doc| watcher.wants(key, doc));
                let is = after.as_ref().is_some_and(|doc| watcher.wants(key, doc));
                let change = match (was, is) {
                    (false, true) => after.clone().map(|data| (ChangeKind::Added, data)),
                    (true, true) => after.clone().map(|data| (ChangeKind::Modified, data)),
                    (true, false) => before.clone().map(|data| (ChangeKind::Removed, data)),
                    (false, false) => None,
                };
                if let Some((kind, data)) = change {
                    snapshot.changes.push(DocumentChange {
                        kind,
                        document: StoredDocument {
                            key: key.clone(),
                            data,
                        },
                    });
                }
            }
            if snapshot.is_empty() {
                return true;
            }
            watcher.tx.send(snapshot).is_ok()
        });
    }
}

/// In-memory document store with push subscriptions. Server timestamps come from the injected clock.
#[derive(Clone)]
pub struct MemoryStatusStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStatusStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    /// 全書き込みを失敗させる（オフライン状態の再現）
    pub fn set_available(&self, available: bool) {
        self.lock().faults.unavailable = !available;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.lock().faults.fail_next_writes = count;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().faults.fail_reads = fail;
    }

    pub fn document(&self, key: &DocumentKey) -> Option<Document> {
        self.lock().document(key).cloned()
    }

    pub fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| StoredDocument {
                        key: DocumentKey::new(collection, id.clone()),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn write_log(&self) -> Vec<WriteEntry> {
        self.lock().write_log.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().write_log.len()
    }

    pub fn writes_touching(&self, key: &DocumentKey) -> usize {
        self.lock()
            .write_log
            .iter()
            .filter(|entry| entry.keys.contains(key))
            .count()
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn unsubscribe(state: &Weak<Mutex<StoreState>>, watcher_id: u64) {
        if let Some(state) = state.upgrade() {
            let mut guard = match state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.watchers.retain(|watcher| watcher.id != watcher_id);
        }
    }
}

#[async_trait]
impl RemoteStatusStore for MemoryStatusStore {
    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, AppError> {
        let state = self.lock();
        state.check_read()?;
        Ok(state.document(key).cloned())
    }

    async fn set(
        &self,
        key: &DocumentKey,
        partial: Document,
        merge: bool,
    ) -> Result<(), AppError> {
        let mut state = self.lock();
        state.check_write()?;
        let (before, after) = state.put(key, partial, merge);
        state.write_log.push(WriteEntry {
            op: WriteOp::Set,
            keys: vec![key.clone()],
        });
        state.fan_out(&[(key.clone(), before, after)]);
        trace!(collection = %key.collection, id = %key.id, merge, "document set");
        Ok(())
    }

    async fn create(
        &self,
        collection: &str,
        mut data: Document,
    ) -> Result<StoredDocument, AppError> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.check_write()?;
        state.next_document_id += 1;
        let id = format!("{}-{:06}", collection, state.next_document_id);
        let key = DocumentKey::new(collection, id);
        data.insert("createdAt".into(), Value::from(now.timestamp_millis()));
        let (before, after) = state.put(&key, data.clone(), false);
        state.write_log.push(WriteEntry {
            op: WriteOp::Create,
            keys: vec![key.clone()],
        });
        state.fan_out(&[(key.clone(), before, after)]);
        Ok(StoredDocument { key, data })
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), AppError> {
        let mut state = self.lock();
        state.check_write()?;
        let (before, after) = state.remove(key);
        state.write_log.push(WriteEntry {
            op: WriteOp::Delete,
            keys: vec![key.clone()],
        });
        state.fan_out(&[(key.clone(), before, after)]);
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<StoredDocument>, AppError> {
        let state = self.lock();
        state.check_read()?;
        let results = state
            .collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| {
                        (DocumentKey::new(query.collection.clone(), id.clone()), data)
                    })
                    .filter(|(key, data)| query.matches(key, data))
                    .map(|(key, data)| StoredDocument {
                        key,
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(results)
    }

    async fn subscribe(
        &self,
        target: WatchTarget,
    ) -> Result<Subscription<StoreSnapshot>, AppError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.check_read()?;

        let initial: Vec<DocumentChange> = match &target {
            WatchTarget::Document(key) => state
                .document(key)
                .cloned()
                .map(|data| DocumentChange {
                    kind: ChangeKind::Added,
                    document: StoredDocument {
                        key: key.clone(),
                        data,
                    },
                })
                .into_iter()
                .collect(),
            WatchTarget::Query(query) => state
                .collections
                .get(&query.collection)
                .map(|docs| {
                    docs.iter()
                        .map(|(id, data)| {
                            (DocumentKey::new(query.collection.clone(), id.clone()), data)
                        })
                        .filter(|(key, data)| query.matches(key, data))
                        .map(|(key, data)| DocumentChange {
                            kind: ChangeKind::Added,
                            document: StoredDocument {
                                key,
                                data: data.clone(),
                            },
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };
        // 初回スナップショットは空でも送る（ドキュメント未作成の判定に使う）
        let _ = tx.send(StoreSnapshot { changes: initial });

        state.next_watcher_id += 1;
        let watcher_id = state.next_watcher_id;
        state.watchers.push(Watcher {
            id: watcher_id,
            target,
            tx,
        });

        let weak = Arc::downgrade(&self.state);
        let handle = SubscriptionHandle::new(move || Self::unsubscribe(&weak, watcher_id));
        Ok(Subscription::new(handle, rx))
    }

    async fn batch_update(&self, updates: Vec<(DocumentKey, Document)>) -> Result<(), AppError> {
        let mut state = self.lock();
        state.check_write()?;
        let mut mutations = Vec::with_capacity(updates.len());
        let mut keys = Vec::with_capacity(updates.len());
        for (key, patch) in updates {
            let (before, after) = state.put(&key, patch, true);
            keys.push(key.clone());
            mutations.push((key, before, after));
        }
        state.write_log.push(WriteEntry {
            op: WriteOp::Batch,
            keys,
        });
        state.fan_out(&mutations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SystemClock;
    use serde_json::json;

    fn store() -> MemoryStatusStore {
        MemoryStatusStore::new(Arc::new(SystemClock))
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn merge_set_keeps_existing_fields() {
        let store = store();
        let key = DocumentKey::new("member_status", "s1");
        store
            .set(&key, doc(json!({"isOnline": true, "role": "member"})), true)
            .await
            .unwrap();
        store
            .set(&key, doc(json!({"isOnline": false})), true)
            .await
            .unwrap();

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.get("role"), Some(&json!("member")));
        assert_eq!(stored.get("isOnline"), Some(&json!(false)));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn query_subscription_reports_added_modified_removed() {
        let store = store();
        let query = StoreQuery::new("messages").where_eq("conversationId", "c1");
        let mut sub = store.subscribe(WatchTarget::Query(query)).await.unwrap();

        let initial = sub.updates.recv().await.unwrap();
        assert!(initial.is_empty());

        let created = store
            .create("messages", doc(json!({"conversationId": "c1", "read": false})))
            .await
            .unwrap();
        assert!(created.data.contains_key("createdAt"));
        let added = sub.updates.recv().await.unwrap();
        assert_eq!(added.changes[0].kind, ChangeKind::Added);

        store
            .batch_update(vec![(created.key.clone(), doc(json!({"read": true})))])
            .await
            .unwrap();
        let modified = sub.updates.recv().await.unwrap();
        assert_eq!(modified.changes[0].kind, ChangeKind::Modified);

        store.delete(&created.key).await.unwrap();
        let removed = sub.updates.recv().await.unwrap();
        assert_eq!(removed.changes[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let store = store();
        let key = DocumentKey::new("operator_status", "a1");
        let sub = store
            .subscribe(WatchTarget::Document(key.clone()))
            .await
            .unwrap();
        assert_eq!(store.watcher_count(), 1);

        sub.handle.cancel();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn failed_batch_leaves_documents_untouched() {
        let store = store();
        let key = DocumentKey::new("messages", "m1");
        store
            .set(&key, doc(json!({"read": false})), false)
            .await
            .unwrap();

        store.set_available(false);
        let result = store
            .batch_update(vec![(key.clone(), doc(json!({"read": true})))])
            .await;
        assert!(matches!(result, Err(AppError::StoreWrite(_))));

        store.set_available(true);
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.get("read"), Some(&json!(false)));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = store();
        let key = DocumentKey::new("member_status", "s1");
        store.fail_next_writes(1);
        assert!(store.set(&key, Document::new(), true).await.is_err());
        assert!(store.set(&key, Document::new(), true).await.is_ok());
    }
}
