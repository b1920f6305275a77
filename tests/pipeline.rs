//! End-to-end watch cycles against a saved schedule page, with an
//! in-process transport standing in for Telegram.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use schedule_watch::error::{CycleError, DeliveryError};
use schedule_watch::fetch::FileFetcher;
use schedule_watch::notify::Notifier;
use schedule_watch::pipeline::{NotifyStatus, Pipeline};
use schedule_watch::recipients::{FileRecipientRegistry, RecipientPatch, RecipientRegistry};
use schedule_watch::snapshot::{SnapshotStore, CURRENT_FILE};
use schedule_watch::transport::Transport;
use schedule_watch_core::detect::Change;
use schedule_watch_core::extract::{ExtractError, Labels};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/schedule.htm")
}

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<(i64, String)>>,
    failures: HashMap<i64, DeliveryError>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        match self.failures.get(&chat_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

struct Env {
    tmp: TempDir,
    page: PathBuf,
    store: SnapshotStore,
    registry: Arc<FileRecipientRegistry>,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let page = tmp.path().join("page.htm");
        std::fs::copy(fixture(), &page).unwrap();
        let store = SnapshotStore::new(tmp.path().join("schedules"), 10);
        let registry = Arc::new(FileRecipientRegistry::new(tmp.path().join("users")));
        Self {
            tmp,
            page,
            store,
            registry,
        }
    }

    fn pipeline(&self, transport: Option<Arc<FakeTransport>>) -> Pipeline {
        self.pipeline_for(&self.page, transport)
    }

    fn pipeline_for(&self, page: &Path, transport: Option<Arc<FakeTransport>>) -> Pipeline {
        let notifier = transport.map(|t| {
            Notifier::new(t, self.registry.clone(), Duration::from_secs(2), 4)
        });
        Pipeline::new(
            Arc::new(FileFetcher::new(page, encoding_rs::WINDOWS_1251)),
            self.store.clone(),
            self.registry.clone(),
            notifier,
            Labels::default(),
        )
    }

    /// Rewrites the page with `from` replaced by `to`, keeping the encoding.
    fn edit_page(&self, from: &str, to: &str) {
        let bytes = std::fs::read(&self.page).unwrap();
        let (text, _, _) = encoding_rs::WINDOWS_1251.decode(&bytes);
        let edited = text.replace(from, to);
        assert_ne!(edited, text, "edit did not apply");
        let (encoded, _, _) = encoding_rs::WINDOWS_1251.encode(&edited);
        std::fs::write(&self.page, encoded).unwrap();
    }

    async fn subscribe(&self, id: i64, chat: i64) {
        self.registry
            .update(id, RecipientPatch::seen(None, chat))
            .await
            .unwrap();
        self.registry
            .update(id, RecipientPatch::subscribed(true))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_first_cycle_stores_and_notifies() {
    let env = Env::new();
    env.subscribe(1, 100).await;
    env.registry
        .update(2, RecipientPatch::seen(None, 200))
        .await
        .unwrap();
    let transport = Arc::new(FakeTransport::default());

    let report = env.pipeline(Some(transport.clone())).run_cycle().await.unwrap();

    let doc = &report.snapshot.document;
    assert_eq!(doc.len(), 2);
    let first = doc.get("12.09.2024").unwrap();
    assert_eq!(first.weekday, "Чт");
    assert_eq!(first.lessons.len(), 3);
    assert_eq!(first.lessons[0].name, "Свободно");
    assert_eq!(first.lessons[1].lesson_number, "2");
    assert_eq!(first.lessons[2].lesson_number, "2");
    assert_eq!(first.lessons[1].subgroup.as_deref(), Some("Подгруппа 1"));
    assert_eq!(first.lessons[2].subgroup.as_deref(), Some("Подгруппа 2"));
    assert_eq!(doc.get("13.09.2024").unwrap().lessons.len(), 1);

    assert!(matches!(
        report.change,
        Change::Changed {
            previous_hash: None,
            ..
        }
    ));
    assert!(report.history_file.is_some());
    assert_eq!(env.store.list().unwrap().len(), 1);
    assert_eq!(
        env.store.current().unwrap().unwrap().content_hash,
        report.snapshot.content_hash
    );

    let NotifyStatus::Sent(delivery) = &report.notification else {
        panic!("expected delivery, got {:?}", report.notification);
    };
    assert_eq!(delivery.delivered, 1);
    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 100);
    assert!(sent[0].1.starts_with("🔄 Расписание обновлено"));
    assert!(sent[0].1.contains("/check"));
}

#[tokio::test]
async fn test_second_cycle_unchanged() {
    let env = Env::new();
    env.subscribe(1, 100).await;
    let transport = Arc::new(FakeTransport::default());
    let pipeline = env.pipeline(Some(transport.clone()));

    let first = pipeline.run_cycle().await.unwrap();
    let second = pipeline.run_cycle().await.unwrap();

    assert_eq!(
        second.change,
        Change::Unchanged {
            hash: first.snapshot.content_hash.clone()
        }
    );
    assert!(second.history_file.is_none());
    assert_eq!(second.notification, NotifyStatus::Skipped);
    assert_eq!(env.store.list().unwrap().len(), 1);
    assert_eq!(transport.sent.lock().unwrap().len(), 1);

    // the current pointer was refreshed
    let current = env.store.current().unwrap().unwrap();
    assert_eq!(current.captured_at, second.snapshot.captured_at);
}

#[tokio::test]
async fn test_edit_reports_changed_day() {
    let env = Env::new();
    let pipeline = env.pipeline(None);
    pipeline.run_cycle().await.unwrap();

    env.edit_page("305", "310");
    let report = pipeline.run_cycle().await.unwrap();
    match &report.change {
        Change::Changed { changed_dates, .. } => {
            assert_eq!(changed_dates, &vec!["13.09.2024".to_string()])
        }
        other => panic!("expected change, got {:?}", other),
    }
    assert_eq!(report.notification, NotifyStatus::NotConfigured);
    assert_eq!(env.store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_fetch_keeps_store() {
    let env = Env::new();
    env.pipeline(None).run_cycle().await.unwrap();
    let before = env.store.current().unwrap().unwrap();

    let missing = env.tmp.path().join("missing.htm");
    let err = env.pipeline_for(&missing, None).run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Fetch(_)));
    assert_eq!(env.store.current().unwrap().unwrap(), before);
    assert_eq!(env.store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_layout_change_keeps_store() {
    let env = Env::new();
    env.pipeline(None).run_cycle().await.unwrap();
    let before = env.store.current().unwrap().unwrap();

    env.edit_page("class=\"inf\"", "class=\"grid\"");
    let err = env.pipeline(None).run_cycle().await.unwrap_err();
    assert!(matches!(err, CycleError::Extract(_)));
    assert_eq!(env.store.current().unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_markup_broken_mid_table_keeps_store() {
    let env = Env::new();
    env.pipeline(None).run_cycle().await.unwrap();
    let before = env.store.current().unwrap().unwrap();

    // everything after the broken comment would otherwise be lost silently
    env.edit_page("<td class=\"hd\">2</td>", "<td class=\"hd\">2</td><!- note ->");
    let err = env.pipeline(None).run_cycle().await.unwrap_err();
    assert!(matches!(
        err,
        CycleError::Extract(ExtractError::Malformed { .. })
    ));
    assert_eq!(env.store.current().unwrap().unwrap(), before);
    assert_eq!(env.store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_corrupt_current_pointer_recovers() {
    let env = Env::new();
    let pipeline = env.pipeline(None);
    pipeline.run_cycle().await.unwrap();

    let current = env.tmp.path().join("schedules").join(CURRENT_FILE);
    std::fs::write(&current, r#"{"captured_at": 1}"#).unwrap();

    let report = pipeline.run_cycle().await.unwrap();
    assert!(matches!(
        report.change,
        Change::Changed {
            previous_hash: None,
            ..
        }
    ));
    assert!(report.history_file.is_some());
    assert_eq!(
        env.store.current().unwrap().unwrap().content_hash,
        report.snapshot.content_hash
    );

    let next = pipeline.run_cycle().await.unwrap();
    assert!(!next.changed());
    assert_eq!(env.store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let env = Env::new();
    let transport = Arc::new(FakeTransport::default());
    env.subscribe(1, 100).await;

    let report = env.pipeline(Some(transport.clone())).dry_run().await.unwrap();
    assert!(report.changed());
    assert_eq!(report.notification, NotifyStatus::Suppressed);
    assert!(env.store.current().unwrap().is_none());
    assert!(transport.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_subscriber_unsubscribed() {
    let env = Env::new();
    env.subscribe(1, 100).await;
    env.subscribe(2, 200).await;
    let mut transport = FakeTransport::default();
    transport.failures.insert(
        200,
        DeliveryError::Unreachable("Forbidden: bot was blocked by the user".to_string()),
    );
    let transport = Arc::new(transport);

    let report = env.pipeline(Some(transport)).run_cycle().await.unwrap();
    let NotifyStatus::Sent(delivery) = &report.notification else {
        panic!("expected delivery");
    };
    assert_eq!(delivery.delivered, 1);
    assert_eq!(delivery.failed, 1);

    assert!(env.registry.get(1).await.unwrap().unwrap().subscribed);
    assert!(!env.registry.get(2).await.unwrap().unwrap().subscribed);
}
