use super::*;
use crate::application::ports::{Document, StoreQuery, StoreSnapshot, Subscription};
use crate::domain::value_objects::PresenceRole;
use crate::infrastructure::store::{MemoryStatusStore, WriteOp};
use crate::infrastructure::timer::VirtualTimerScheduler;
use async_trait::async_trait;
use mockall::mock;
use std::time::Duration;

mock! {
    pub Store {}

    #[async_trait]
    impl RemoteStatusStore for Store {
        async fn get(&self, key: &DocumentKey) -> Result<Option<Document>, AppError>;

        async fn set(
            &self,
            key: &DocumentKey,
            partial: Document,
            merge: bool,
        ) -> Result<(), AppError>;

        async fn create(&self, collection: &str, data: Document) -> Result<StoredDocument, AppError>;

        async fn delete(&self, key: &DocumentKey) -> Result<(), AppError>;

        async fn query(&self, query: &StoreQuery) -> Result<Vec<StoredDocument>, AppError>;

        async fn subscribe(
            &self,
            target: WatchTarget,
        ) -> Result<Subscription<StoreSnapshot>, AppError>;

        async fn batch_update(&self, updates: Vec<(DocumentKey, Document)>) -> Result<(), AppError>;
    }
}

/// Accepts writes but never answers them.
struct StalledStore;

#[async_trait]
impl RemoteStatusStore for StalledStore {
    async fn get(&self, _key: &DocumentKey) -> Result<Option<Document>, AppError> {
        Ok(None)
    }

    async fn set(&self, _key: &DocumentKey, _partial: Document, _merge: bool) -> Result<(), AppError> {
        futures::future::pending().await
    }

    async fn create(&self, _collection: &str, _data: Document) -> Result<StoredDocument, AppError> {
        futures::future::pending().await
    }

    async fn delete(&self, _key: &DocumentKey) -> Result<(), AppError> {
        futures::future::pending().await
    }

    async fn query(&self, _query: &StoreQuery) -> Result<Vec<StoredDocument>, AppError> {
        Ok(Vec::new())
    }

    async fn subscribe(&self, _target: WatchTarget) -> Result<Subscription<StoreSnapshot>, AppError> {
        Err(AppError::StoreRead("not supported".to_string()))
    }

    async fn batch_update(&self, _updates: Vec<(DocumentKey, Document)>) -> Result<(), AppError> {
        futures::future::pending().await
    }
}

fn conversation() -> ConversationKey {
    ConversationKey::new(ConversationId::new("student-1").unwrap(), ["admin-1"])
}

fn student() -> MessageAuthor {
    MessageAuthor::new("student-1", PresenceRole::Member).with_display_name("Aiko")
}

fn admin() -> MessageAuthor {
    MessageAuthor::new("admin-1", PresenceRole::Operator).with_display_name("Sato")
}

fn fixture(
    config: AppConfig,
) -> (
    MessageDeliveryPipeline,
    Arc<MemoryStatusStore>,
    Arc<VirtualTimerScheduler>,
) {
    let timers = Arc::new(VirtualTimerScheduler::new());
    let store = Arc::new(MemoryStatusStore::new(timers.clone()));
    let pipeline = MessageDeliveryPipeline::new(&config, store.clone(), timers.clone());
    (pipeline, store, timers)
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn send_is_visible_as_pending_before_persist() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();

    let ticket = pipeline.send(&conversation, "  hello  ", &student()).unwrap();

    let local = pipeline.snapshot_of(&conversation.id);
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].status, DeliveryStatus::Pending);
    assert_eq!(local[0].content, "hello");
    assert!(local[0].id.is_local());
    assert_eq!(store.write_count(), 0);

    let outcome = ticket.outcome().await.unwrap();
    let DeliveryOutcome::Delivered(message) = outcome else {
        panic!("expected delivery, got {outcome:?}");
    };
    assert!(!message.id.is_local());
    assert!(message.created_at.is_some());

    let local = pipeline.snapshot_of(&conversation.id);
    assert_eq!(local[0].status, DeliveryStatus::Delivered);
    assert_eq!(local[0].id, message.id);
}

#[tokio::test]
async fn invalid_content_is_rejected_without_writes() {
    let mut config = AppConfig::default();
    config.messaging.max_content_length = 5;
    let (pipeline, store, _timers) = fixture(config);

    assert!(matches!(
        pipeline.send(&conversation(), "   ", &student()),
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        pipeline.send(&conversation(), "too long", &student()),
        Err(AppError::ValidationError(_))
    ));
    assert!(pipeline.snapshot_of(&conversation().id).is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn failed_send_stays_visible_and_retry_delivers() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    store.set_available(false);

    let ticket = pipeline.send(&conversation, "hello", &student()).unwrap();
    let message_id = ticket.message_id.clone();
    let outcome = ticket.outcome().await.unwrap();
    assert!(matches!(outcome, DeliveryOutcome::Failed { .. }));

    let local = pipeline.snapshot_of(&conversation.id);
    assert_eq!(local[0].status, DeliveryStatus::Failed);
    assert!(local[0].last_error.is_some());

    store.set_available(true);
    let retried = pipeline.retry(&message_id).unwrap();
    let outcome = retried.outcome().await.unwrap();
    let DeliveryOutcome::Delivered(message) = outcome else {
        panic!("expected delivery, got {outcome:?}");
    };
    assert_eq!(message.content, "hello");
    assert_eq!(message.sender_id, "student-1");
    assert_eq!(message.last_error, None);
    assert_eq!(store.documents("messages").len(), 1);
}

#[tokio::test]
async fn retry_of_delivered_message_is_rejected_without_writes() {
    let mut store = MockStore::new();
    store.expect_create().times(1).returning(|collection, mut data| {
        data.insert("createdAt".into(), serde_json::Value::from(1_000_i64));
        Ok(StoredDocument {
            key: DocumentKey::new(collection, "remote-1"),
            data,
        })
    });
    store.expect_set().times(0);
    store.expect_batch_update().times(0);

    let timers = Arc::new(VirtualTimerScheduler::new());
    let pipeline = MessageDeliveryPipeline::new(&AppConfig::default(), Arc::new(store), timers);

    let ticket = pipeline.send(&conversation(), "hello", &student()).unwrap();
    let provisional = ticket.message_id.clone();
    ticket.outcome().await.unwrap();

    let result = pipeline.retry(&provisional);
    assert!(matches!(result, Err(AppError::InvalidState(_))));

    let result = pipeline.retry(&MessageId::remote("remote-1"));
    assert!(matches!(result, Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn retry_of_pending_message_is_rejected() {
    let pipeline = MessageDeliveryPipeline::new(
        &AppConfig::default(),
        Arc::new(StalledStore),
        Arc::new(VirtualTimerScheduler::new()),
    );
    let ticket = pipeline.send(&conversation(), "hello", &student()).unwrap();

    assert!(matches!(
        pipeline.retry(&ticket.message_id),
        Err(AppError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unanswered_write_times_out_as_failed() {
    let pipeline = MessageDeliveryPipeline::new(
        &AppConfig::default(),
        Arc::new(StalledStore),
        Arc::new(VirtualTimerScheduler::new()),
    );
    let conversation = conversation();

    let ticket = pipeline.send(&conversation, "hello", &student()).unwrap();
    let outcome = ticket.outcome().await.unwrap();

    let DeliveryOutcome::Failed { reason, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("timed out"));
    assert_eq!(
        pipeline.snapshot_of(&conversation.id)[0].status,
        DeliveryStatus::Failed
    );
}

#[tokio::test]
async fn delete_removes_locally_and_remotely() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let ticket = pipeline.send(&conversation, "bye", &student()).unwrap();
    let client_id = MessageId::from(ticket.client_id.clone());
    ticket.outcome().await.unwrap();

    pipeline.delete(&client_id).await.unwrap();

    assert!(pipeline.snapshot_of(&conversation.id).is_empty());
    assert!(store.documents("messages").is_empty());
    assert!(matches!(
        pipeline.delete(&client_id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn send_time_id_still_finds_and_deletes_after_delivery() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let ticket = pipeline.send(&conversation, "wrong room", &student()).unwrap();
    let send_time_id = ticket.message_id.clone();
    let DeliveryOutcome::Delivered(delivered) = ticket.outcome().await.unwrap() else {
        panic!("expected delivery");
    };
    assert_ne!(delivered.id, send_time_id);

    let found = pipeline.find(&send_time_id).unwrap();
    assert_eq!(found.id, delivered.id);

    pipeline.delete(&send_time_id).await.unwrap();
    assert!(pipeline.snapshot_of(&conversation.id).is_empty());
    assert!(store.documents("messages").is_empty());
}

#[tokio::test]
async fn local_events_follow_send_failure_and_delete() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let mut events = pipeline.local_events();

    store.fail_next_writes(1);
    let ticket = pipeline.send(&conversation, "see you", &admin()).unwrap();
    let message_id = ticket.message_id.clone();
    assert!(matches!(
        ticket.outcome().await.unwrap(),
        DeliveryOutcome::Failed { .. }
    ));
    pipeline.delete(&message_id).await.unwrap();

    let LocalMessageEvent::Upserted(pending) = events.recv().await.unwrap() else {
        panic!("expected the pending send first");
    };
    assert_eq!(pending.status, DeliveryStatus::Pending);
    let LocalMessageEvent::Upserted(failed) = events.recv().await.unwrap() else {
        panic!("expected the failure next");
    };
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(
        events.recv().await.unwrap(),
        LocalMessageEvent::Removed {
            client_id: pending.client_id.clone()
        }
    );
}

#[tokio::test]
async fn delete_during_send_discards_remote_copy() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let ticket = pipeline.send(&conversation, "oops", &student()).unwrap();

    pipeline.delete(&ticket.message_id).await.unwrap();
    let outcome = ticket.outcome().await.unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Discarded { .. }));
    assert!(pipeline.snapshot_of(&conversation.id).is_empty());
    assert!(store.documents("messages").is_empty());
}

#[tokio::test]
async fn failed_remote_delete_surfaces_but_stays_removed() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let ticket = pipeline.send(&conversation, "keep?", &student()).unwrap();
    let DeliveryOutcome::Delivered(message) = ticket.outcome().await.unwrap() else {
        panic!("expected delivery");
    };

    store.fail_next_writes(1);
    let result = pipeline.delete(&message.id).await;

    assert!(matches!(result, Err(AppError::StoreWrite(_))));
    assert!(pipeline.snapshot_of(&conversation.id).is_empty());
    assert_eq!(store.documents("messages").len(), 1);
}

#[tokio::test]
async fn mark_read_twice_writes_once() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    for text in ["first", "second"] {
        let ticket = pipeline.send(&conversation, text, &admin()).unwrap();
        ticket.outcome().await.unwrap();
    }
    let own = pipeline.send(&conversation, "mine", &student()).unwrap();
    own.outcome().await.unwrap();
    let writes_before = store.write_count();

    let marked = pipeline
        .mark_conversation_read(&conversation.id, "student-1")
        .await
        .unwrap();
    assert_eq!(marked, 2);

    let again = pipeline
        .mark_conversation_read(&conversation.id, "student-1")
        .await
        .unwrap();
    assert_eq!(again, 0);

    let log = store.write_log();
    assert_eq!(log.len(), writes_before + 1);
    assert_eq!(log.last().map(|entry| entry.op), Some(WriteOp::Batch));

    let local = pipeline.snapshot_of(&conversation.id);
    let unread_own: Vec<_> = local.iter().filter(|m| !m.read).collect();
    assert_eq!(unread_own.len(), 1);
    assert_eq!(unread_own[0].sender_id, "student-1");
}

#[tokio::test]
async fn large_read_batches_are_chunked() {
    let mut config = AppConfig::default();
    config.messaging.read_batch_limit = 2;
    let (pipeline, store, _timers) = fixture(config);
    let conversation = conversation();
    for index in 0..5 {
        let ticket = pipeline
            .send(&conversation, &format!("note {index}"), &admin())
            .unwrap();
        ticket.outcome().await.unwrap();
    }

    let marked = pipeline
        .mark_conversation_read(&conversation.id, "student-1")
        .await
        .unwrap();

    assert_eq!(marked, 5);
    let batches = store
        .write_log()
        .into_iter()
        .filter(|entry| entry.op == WriteOp::Batch)
        .count();
    assert_eq!(batches, 3);
}

#[tokio::test]
async fn failed_read_batch_changes_nothing() {
    let (pipeline, store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    let ticket = pipeline.send(&conversation, "hi", &admin()).unwrap();
    ticket.outcome().await.unwrap();

    store.fail_next_writes(1);
    let result = pipeline
        .mark_conversation_read(&conversation.id, "student-1")
        .await;
    assert!(result.is_err());

    let marked = pipeline
        .mark_conversation_read(&conversation.id, "student-1")
        .await
        .unwrap();
    assert_eq!(marked, 1);
}

#[tokio::test]
async fn attached_conversation_orders_by_server_time_not_arrival() {
    let (sender_side, store, timers) = fixture(AppConfig::default());
    let reader_side =
        MessageDeliveryPipeline::new(&AppConfig::default(), store.clone(), timers.clone());
    let conversation = conversation();

    reader_side.attach(&conversation.id).await.unwrap();
    reader_side.attach(&conversation.id).await.unwrap();
    assert_eq!(store.watcher_count(), 1);

    timers.advance(Duration::from_secs(60)).await;
    let later = sender_side.send(&conversation, "later", &admin()).unwrap();
    later.outcome().await.unwrap();
    settle().await;

    // arrives second but was stamped a minute earlier
    let earlier_key = DocumentKey::new("messages", "older-1");
    let mut earlier = message_to_document(&Message::new_pending(
        &conversation,
        &student(),
        "earlier".to_string(),
        timers.now(),
    ));
    earlier.insert(
        "createdAt".into(),
        serde_json::Value::from(timers.now().timestamp_millis() - 60_000),
    );
    store.set(&earlier_key, earlier, false).await.unwrap();
    settle().await;

    let contents: Vec<String> = reader_side
        .snapshot_of(&conversation.id)
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["earlier", "later"]);

    store.delete(&earlier_key).await.unwrap();
    settle().await;
    assert_eq!(reader_side.snapshot_of(&conversation.id).len(), 1);

    reader_side.detach_all();
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn own_sends_are_not_duplicated_by_the_feed() {
    let (pipeline, _store, _timers) = fixture(AppConfig::default());
    let conversation = conversation();
    pipeline.attach(&conversation.id).await.unwrap();

    let ticket = pipeline.send(&conversation, "once", &student()).unwrap();
    ticket.outcome().await.unwrap();
    settle().await;

    let local = pipeline.snapshot_of(&conversation.id);
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].status, DeliveryStatus::Delivered);
}
