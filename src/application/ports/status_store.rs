use super::subscription::Subscription;
use crate::shared::error::AppError;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: DocumentKey,
    pub data: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    Equals(String, Value),
    ArrayContains(String, Value),
}

impl FieldFilter {
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            FieldFilter::Equals(field, expected) => document.get(field) == Some(expected),
            FieldFilter::ArrayContains(field, expected) => document
                .get(field)
                .and_then(Value::as_array)
                .map(|items| items.contains(expected))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
}

impl StoreQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters
            .push(FieldFilter::Equals(field.into(), value.into()));
        self
    }

    pub fn where_array_contains(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters
            .push(FieldFilter::ArrayContains(field.into(), value.into()));
        self
    }

    pub fn matches(&self, key: &DocumentKey, document: &Document) -> bool {
        key.collection == self.collection && self.filters.iter().all(|f| f.matches(document))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    Document(DocumentKey),
    Query(StoreQuery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: StoredDocument,
}

/// One push from the store. Delivery is at-least-once; a change may be seen again.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreSnapshot {
    pub changes: Vec<DocumentChange>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[async_trait]
pub trait RemoteStatusStore: Send + Sync {
    async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, AppError>;

    async fn set(&self, key: &DocumentKey, partial: Document, merge: bool)
        -> Result<(), AppError>;

    /// Inserts under a store-assigned id and stamps `createdAt` with the server time.
    async fn create(&self, collection: &str, data: Document) -> Result<StoredDocument, AppError>;

    async fn delete(&self, key: &DocumentKey) -> Result<(), AppError>;

    async fn query(&self, query: &StoreQuery) -> Result<Vec<StoredDocument>, AppError>;

    async fn subscribe(&self, target: WatchTarget)
        -> Result<Subscription<StoreSnapshot>, AppError>;

    /// Commits every merge-update or none of them.
    async fn batch_update(&self, updates: Vec<(DocumentKey, Document)>) -> Result<(), AppError>;
}
