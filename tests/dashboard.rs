//! Dashboard API over a real listener.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use schedule_watch::config::TransportConfig;
use schedule_watch::error::DeliveryError;
use schedule_watch::recipients::{FileRecipientRegistry, RecipientPatch, RecipientRegistry};
use schedule_watch::server::{router, AppState};
use schedule_watch::snapshot::SnapshotStore;
use schedule_watch::supervisor::WorkerSupervisor;
use schedule_watch::transport::Transport;
use schedule_watch_core::models::{Day, Lesson, ScheduleDocument, Snapshot};

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

struct Dashboard {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    store: SnapshotStore,
    registry: Arc<FileRecipientRegistry>,
    log_path: PathBuf,
    transport: Option<Arc<FakeTransport>>,
}

async fn start(with_transport: bool) -> Dashboard {
    let tmp = TempDir::new().unwrap();
    let store = SnapshotStore::new(tmp.path().join("schedules"), 10);
    let registry = Arc::new(FileRecipientRegistry::new(tmp.path().join("users")));
    let log_path = tmp.path().join("swatch.log");
    let supervisor = Arc::new(WorkerSupervisor::new("sleep", vec!["30".to_string()]));

    let mut state = AppState::new(store.clone(), registry.clone(), supervisor, log_path.clone());
    let transport = with_transport.then(|| Arc::new(FakeTransport::default()));
    if let Some(t) = &transport {
        state = state.with_transport(t.clone(), &TransportConfig::default());
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    Dashboard {
        _tmp: tmp,
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        store,
        registry,
        log_path,
        transport,
    }
}

impl Dashboard {
    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut req = self.client.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

fn sample_snapshot() -> Snapshot {
    let mut doc = ScheduleDocument::new();
    doc.insert(
        "12.09.2024",
        Day {
            weekday: "Чт".to_string(),
            lessons: vec![Lesson::placeholder("1", "Свободно")],
        },
    );
    Snapshot::capture(doc)
}

#[tokio::test]
async fn test_health() {
    let d = start(false).await;
    let (status, body) = d.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_schedules() {
    let d = start(false).await;

    let (status, body) = d.get("/schedules/current").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let name = d.store.put(&sample_snapshot()).unwrap();

    let (status, body) = d.get("/schedules").await;
    assert_eq!(status, 200);
    assert_eq!(body["snapshots"][0]["name"], name.as_str());

    let (status, body) = d.get("/schedules/current").await;
    assert_eq!(status, 200);
    assert_eq!(body["document"]["12.09.2024"]["weekday"], "Чт");

    let (status, body) = d.get(&format!("/schedules/{}", name)).await;
    assert_eq!(status, 200);
    assert_eq!(body["document"]["12.09.2024"]["lessons"][0]["name"], "Свободно");

    let text = d
        .client
        .get(format!("{}/schedules/{}/text", d.base, name))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("📅 12.09.2024 (Чт):"));

    let (status, body) = d.get("/schedules/not-a-snapshot.json").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = d.get("/schedules/20200101_000000_000000.json").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_ban_and_unban() {
    let d = start(true).await;
    d.registry
        .update(7, RecipientPatch::seen(Some("anna".to_string()), 70))
        .await
        .unwrap();

    let (status, body) = d
        .post("/users/7/ban", Some(json!({ "reason": "spam" })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["user"]["blocked"], true);
    assert_eq!(body["notice"]["status"], "sent");
    assert!(d.registry.get(7).await.unwrap().unwrap().blocked);

    let (status, body) = d.post("/users/7/unban", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["user"]["blocked"], false);

    let sent = d.transport.as_ref().unwrap().sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, "🚫 Вы были заблокированы в боте.\nПричина: spam");
    assert_eq!(sent[1].1, "✅ Ваша блокировка в боте снята!");

    let (status, body) = d.get("/users").await;
    assert_eq!(status, 200);
    assert_eq!(body["users"][0]["id"], 7);
}

#[tokio::test]
async fn test_ban_unknown_user() {
    let d = start(false).await;
    let (status, body) = d.post("/users/404/ban", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_ban_without_transport() {
    let d = start(false).await;
    d.registry
        .update(1, RecipientPatch::seen(None, 10))
        .await
        .unwrap();
    let (status, body) = d.post("/users/1/ban", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["user"]["blocked_reason"], "Нарушение правил");
    assert_eq!(body["notice"]["status"], "not_configured");
}

#[tokio::test]
async fn test_broadcast() {
    let d = start(true).await;
    for (id, chat) in [(1, 10), (2, 20)] {
        d.registry
            .update(id, RecipientPatch::seen(None, chat))
            .await
            .unwrap();
    }
    d.registry
        .update(3, RecipientPatch::block("x"))
        .await
        .unwrap();

    let (status, body) = d
        .post("/broadcast", Some(json!({ "message": "Пары отменены" })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], 2);
    assert_eq!(body["failed"], 0);

    let (status, body) = d
        .post("/broadcast", Some(json!({ "message": "hi", "user_id": 2 })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["delivered"], 1);

    let (status, _) = d
        .post("/broadcast", Some(json!({ "message": "hi", "user_id": 99 })))
        .await;
    assert_eq!(status, 404);

    let (status, body) = d.post("/broadcast", Some(json!({ "message": "  " }))).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_broadcast_not_configured() {
    let d = start(false).await;
    let (status, body) = d
        .post("/broadcast", Some(json!({ "message": "hi" })))
        .await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "not_configured");
}

#[tokio::test]
async fn test_logs_tail_and_clear() {
    let d = start(false).await;
    let (status, body) = d.get("/logs").await;
    assert_eq!(status, 200);
    assert_eq!(body["lines"], json!([]));

    let content: String = (1..=5).map(|i| format!("line {}\n", i)).collect();
    std::fs::write(&d.log_path, content).unwrap();

    let (_, body) = d.get("/logs?lines=2").await;
    assert_eq!(body["lines"], json!(["line 4", "line 5"]));

    let resp = d
        .client
        .delete(format!("{}/logs", d.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(std::fs::read_to_string(&d.log_path).unwrap(), "");
}

#[tokio::test]
async fn test_worker_lifecycle() {
    let d = start(false).await;

    let (status, body) = d.get("/worker").await;
    assert_eq!(status, 200);
    assert_eq!(body["running"], false);

    let (status, body) = d.post("/worker/start", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["running"], true);
    let pid = body["pid"].as_u64().unwrap();

    let (status, body) = d.post("/worker/start", None).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = d.post("/worker/restart", None).await;
    assert_eq!(status, 200);
    assert_ne!(body["pid"].as_u64().unwrap(), pid);

    let (status, body) = d.post("/worker/stop", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["running"], false);
}
