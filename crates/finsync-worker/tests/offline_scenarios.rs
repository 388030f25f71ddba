//! End-to-end offline behaviour of the worker against a simulated network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use finsync_cache::CacheStorage;
use finsync_common::config::CacheNames;
use finsync_common::WorkerConfig;
use finsync_net::{Fetcher, NetError, Request, Response, ResponseSource};
use finsync_store::LocalDatabase;
use finsync_worker::{
    EventOutcome, NetworkState, OfflineWorker, SyncManager, SyncReport, WorkerEvent, WorkerState,
    SOURCE_HEADER,
};
use http::{HeaderValue, Method};
use serde_json::{json, Value as JsonValue};
use url::Url;

const ORIGIN: &str = "http://localhost:3000";

/// A request as the network saw it.
#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
}

/// Network with an on/off switch and canned answers per method and path.
#[derive(Default)]
struct SimulatedNetwork {
    offline: AtomicBool,
    answers: Mutex<HashMap<(Method, String), Response>>,
    seen: Mutex<Vec<Seen>>,
}

impl SimulatedNetwork {
    fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    fn answer(&self, method: Method, path: &str, response: Response) {
        self.answers
            .lock()
            .unwrap()
            .insert((method, path.to_string()), response);
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn calls_to(&self, path: &str) -> usize {
        self.seen()
            .iter()
            .filter(|s| Url::parse(&s.url).unwrap().path() == path)
            .count()
    }
}

#[async_trait]
impl Fetcher for SimulatedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.seen.lock().unwrap().push(Seen {
            method: request.method.clone(),
            url: request.url.to_string(),
            headers: request.header_pairs().into_iter().collect(),
            body: request.body_text().unwrap(),
        });

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network is offline".to_string()));
        }

        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&(request.method.clone(), request.path().to_string()))
            .cloned();
        Ok(answer.unwrap_or_else(|| Response::new(404, "")))
    }
}

struct Setup {
    worker: OfflineWorker,
    network: Arc<SimulatedNetwork>,
    sync: Arc<SyncManager>,
    caches: CacheStorage,
}

fn setup_with(config: WorkerConfig, caches: CacheStorage, database: LocalDatabase) -> Setup {
    let network = Arc::new(SimulatedNetwork::default());
    let sync = Arc::new(SyncManager::new(NetworkState::Online));
    let worker = OfflineWorker::new(config, network.clone(), caches.clone(), database, sync.clone());
    Setup {
        worker,
        network,
        sync,
        caches,
    }
}

fn setup() -> Setup {
    setup_with(
        WorkerConfig::default(),
        CacheStorage::new(),
        LocalDatabase::in_memory("finance-offline", 1),
    )
}

fn request(method: Method, path: &str) -> Request {
    Request::parse(method, &format!("{}{}", ORIGIN, path)).unwrap()
}

async fn fetch(worker: &OfflineWorker, request: Request) -> Response {
    match worker.dispatch(WorkerEvent::Fetch(request)).await.unwrap() {
        EventOutcome::Response(response) => response,
        other => panic!("expected a response, got {:?}", other),
    }
}

async fn sync(worker: &OfflineWorker) -> SyncReport {
    match worker
        .dispatch(WorkerEvent::Sync {
            tag: "sync-transactions".to_string(),
        })
        .await
        .unwrap()
    {
        EventOutcome::Synced(report) => report,
        other => panic!("expected a sync report, got {:?}", other),
    }
}

async fn queue_len(worker: &OfflineWorker) -> usize {
    worker.database().open().await.unwrap().queue_len().await.unwrap()
}

fn mutation(method: Method, path: &str, body: &str) -> Request {
    request(method, path)
        .header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .header(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer session-token"),
        )
        .body(body.to_string())
}

#[tokio::test]
async fn test_api_read_survives_going_offline() {
    let s = setup();
    let accounts = json!([{"id": "a1", "name": "Checking", "current_balance": 100}]);
    s.network
        .answer(Method::GET, "/api/accounts", Response::json(200, &accounts));

    let online = fetch(&s.worker, request(Method::GET, "/api/accounts")).await;
    assert_eq!(online.status, 200);
    assert_eq!(online.json_body::<JsonValue>().unwrap(), accounts);

    s.network.set_online(false);
    let offline = fetch(&s.worker, request(Method::GET, "/api/accounts")).await;
    assert_eq!(offline.status, 200);
    assert_eq!(offline.json_body::<JsonValue>().unwrap(), accounts);
}

#[tokio::test]
async fn test_api_read_from_local_store_when_cache_is_gone() {
    let s = setup();
    let accounts = json!([{"id": "a1", "name": "Checking", "current_balance": 100}]);
    s.network
        .answer(Method::GET, "/api/accounts", Response::json(200, &accounts));
    fetch(&s.worker, request(Method::GET, "/api/accounts")).await;

    s.caches
        .delete(&s.worker.config().caches.api_bucket)
        .await;
    s.network.set_online(false);

    let offline = fetch(&s.worker, request(Method::GET, "/api/accounts")).await;
    assert_eq!(offline.status, 200);
    assert_eq!(offline.source, ResponseSource::LocalStore);
    assert_eq!(offline.header_str(SOURCE_HEADER), Some("local-store"));
    assert_eq!(offline.json_body::<JsonValue>().unwrap(), accounts);
}

#[tokio::test]
async fn test_offline_post_is_accepted_and_queued() {
    let s = setup();
    s.network.set_online(false);

    let response = fetch(
        &s.worker,
        mutation(Method::POST, "/api/transactions", r#"{"description":"Coffee","value":5}"#),
    )
    .await;

    assert_eq!(response.status, 202);
    let body: JsonValue = response.json_body().unwrap();
    assert_eq!(body["offline"], true);
    assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
    assert_eq!(queue_len(&s.worker).await, 1);
}

#[tokio::test]
async fn test_offline_mutations_preserved_verbatim() {
    let s = setup();
    s.network.set_online(false);

    let cases = [
        (Method::POST, "/api/transactions", r#"{"description":"Rent","value":1200}"#),
        (Method::PUT, "/api/budgets/4", r#"{"limit":300}"#),
        (Method::DELETE, "/api/goals/9", ""),
    ];
    for (method, path, body) in &cases {
        let response = fetch(&s.worker, mutation(method.clone(), path, body)).await;
        assert_eq!(response.status, 202, "{} {}", method, path);
    }

    let queued = s
        .worker
        .database()
        .open()
        .await
        .unwrap()
        .queued_operations()
        .await
        .unwrap();
    assert_eq!(queued.len(), cases.len());

    for (op, (method, path, body)) in queued.iter().zip(cases.iter()) {
        assert_eq!(op.method, method.as_str());
        assert_eq!(op.url, format!("{}{}", ORIGIN, path));
        assert_eq!(op.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(op.headers.get("authorization").unwrap(), "Bearer session-token");
        assert_eq!(op.body.as_deref(), Some(*body));
    }
}

#[tokio::test]
async fn test_sync_replays_queued_post() {
    let s = setup();
    s.network.set_online(false);
    fetch(
        &s.worker,
        mutation(Method::POST, "/api/transactions", r#"{"description":"Coffee","value":5}"#),
    )
    .await;

    s.network.set_online(true);
    s.network
        .answer(Method::POST, "/api/transactions", Response::json(201, &json!({"id": 77})));

    let report = sync(&s.worker).await;
    assert_eq!(
        report,
        SyncReport {
            attempted: 1,
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(queue_len(&s.worker).await, 0);

    let replayed = s.network.seen().pop().unwrap();
    assert_eq!(replayed.method, Method::POST);
    assert_eq!(replayed.url, format!("{}/api/transactions", ORIGIN));
    assert_eq!(replayed.body.as_deref(), Some(r#"{"description":"Coffee","value":5}"#));
    assert_eq!(replayed.headers.get("authorization").unwrap(), "Bearer session-token");
}

#[tokio::test]
async fn test_sync_attempts_each_once_and_keeps_failures() {
    let s = setup();
    s.network.set_online(false);
    fetch(&s.worker, mutation(Method::POST, "/api/transactions", "{}")).await;
    fetch(&s.worker, mutation(Method::PUT, "/api/budgets/1", "{}")).await;
    fetch(&s.worker, mutation(Method::DELETE, "/api/goals/2", "")).await;

    s.network.set_online(true);
    s.network
        .answer(Method::POST, "/api/transactions", Response::new(201, ""));
    s.network
        .answer(Method::PUT, "/api/budgets/1", Response::new(500, ""));
    s.network
        .answer(Method::DELETE, "/api/goals/2", Response::new(204, ""));

    let before = s.network.seen().len();
    let report = sync(&s.worker).await;
    assert_eq!(
        report,
        SyncReport {
            attempted: 3,
            succeeded: 2,
            failed: 1
        }
    );
    assert_eq!(s.network.seen().len() - before, 3);

    let remaining = s
        .worker
        .database()
        .open()
        .await
        .unwrap()
        .queued_operations()
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].method, "PUT");

    // The failure is retried on the next trigger.
    s.network
        .answer(Method::PUT, "/api/budgets/1", Response::new(200, ""));
    let report = sync(&s.worker).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue_len(&s.worker).await, 0);
}

#[tokio::test]
async fn test_sync_while_still_offline_keeps_everything() {
    let s = setup();
    s.network.set_online(false);
    fetch(&s.worker, mutation(Method::POST, "/api/transactions", "{}")).await;

    let report = sync(&s.worker).await;
    assert_eq!(report.failed, 1);
    assert_eq!(queue_len(&s.worker).await, 1);
}

#[tokio::test]
async fn test_sync_fires_when_connectivity_returns() {
    let s = setup();
    s.sync.update_network_state(NetworkState::Offline).await;
    s.network.set_online(false);
    fetch(&s.worker, mutation(Method::POST, "/api/transactions", "{}")).await;

    assert!(s.worker.fire_ready_syncs(&s.sync).await.is_empty());

    s.network.set_online(true);
    s.network
        .answer(Method::POST, "/api/transactions", Response::new(201, ""));
    s.sync.update_network_state(NetworkState::Online).await;

    let reports = s.worker.fire_ready_syncs(&s.sync).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].succeeded, 1);
    assert_eq!(queue_len(&s.worker).await, 0);
    assert!(s.sync.tags().await.is_empty());
}

#[tokio::test]
async fn test_static_hit_never_touches_network() {
    let s = setup();
    for asset in &s.worker.config().static_assets {
        s.network
            .answer(Method::GET, asset, Response::new(200, format!("asset {}", asset)));
    }
    s.worker.dispatch(WorkerEvent::Install).await.unwrap();
    let after_install = s.network.seen().len();

    let response = fetch(&s.worker, request(Method::GET, "/logo512.png")).await;
    assert_eq!(response.text_body().unwrap(), "asset /logo512.png");
    assert_eq!(s.network.seen().len(), after_install);
}

#[tokio::test]
async fn test_static_miss_fetches_exactly_once() {
    let s = setup();
    s.network
        .answer(Method::GET, "/favicon.ico", Response::new(200, "ico"));

    fetch(&s.worker, request(Method::GET, "/favicon.ico")).await;
    assert_eq!(s.network.calls_to("/favicon.ico"), 1);

    let bucket = s.caches.open(&s.worker.config().caches.static_bucket).await;
    assert!(bucket
        .match_request(&request(Method::GET, "/favicon.ico"))
        .await
        .is_some());

    fetch(&s.worker, request(Method::GET, "/favicon.ico")).await;
    assert_eq!(s.network.calls_to("/favicon.ico"), 1);
}

#[tokio::test]
async fn test_install_fails_when_an_asset_is_missing() {
    let config = WorkerConfig {
        static_assets: vec!["/".to_string(), "/manifest.json".to_string()],
        ..WorkerConfig::default()
    };
    let s = setup_with(
        config,
        CacheStorage::new(),
        LocalDatabase::in_memory("finance-offline", 1),
    );
    s.network
        .answer(Method::GET, "/", Response::new(200, "<html></html>"));
    s.network
        .answer(Method::GET, "/manifest.json", Response::new(404, ""));

    let result = s.worker.dispatch(WorkerEvent::Install).await;
    assert!(result.is_err());
    assert_eq!(s.worker.state().await, WorkerState::Redundant);

    let shell = s.caches.open(&s.worker.config().caches.static_bucket).await;
    assert!(shell.is_empty().await);
    assert!(s.worker.dispatch(WorkerEvent::Activate).await.is_err());
}

#[tokio::test]
async fn test_version_bump_evicts_old_caches() {
    let caches = CacheStorage::new();

    // Worker v1 fills its caches.
    let v1 = setup_with(
        WorkerConfig::default(),
        caches.clone(),
        LocalDatabase::in_memory("finance-offline", 1),
    );
    for asset in &v1.worker.config().static_assets {
        v1.network
            .answer(Method::GET, asset, Response::new(200, "v1"));
    }
    v1.network
        .answer(Method::GET, "/api/categories", Response::json(200, &json!(["food"])));
    v1.worker.dispatch(WorkerEvent::Install).await.unwrap();
    v1.worker.dispatch(WorkerEvent::Activate).await.unwrap();
    fetch(&v1.worker, request(Method::GET, "/api/categories")).await;

    // Worker v2 activates over the same cache storage.
    let v2_config = WorkerConfig {
        caches: CacheNames::for_version("v2"),
        ..WorkerConfig::default()
    };
    let v2 = setup_with(
        v2_config,
        caches.clone(),
        LocalDatabase::in_memory("finance-offline", 1),
    );
    for asset in &v2.worker.config().static_assets {
        v2.network
            .answer(Method::GET, asset, Response::new(200, "v2"));
    }
    v2.worker.dispatch(WorkerEvent::Install).await.unwrap();

    match v2.worker.dispatch(WorkerEvent::Activate).await.unwrap() {
        EventOutcome::Activated(activation) => {
            let mut deleted = activation.deleted_caches;
            deleted.sort();
            assert_eq!(deleted, vec!["finance-api-v1", "finance-static-v1"]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let mut names = caches.keys().await;
    names.sort();
    assert_eq!(names, vec!["finance-static-v2"]);

    // Nothing cached by v1 is reachable any more.
    assert!(caches
        .match_any(&request(Method::GET, "/api/categories"))
        .await
        .is_none());
    let root = caches.match_any(&request(Method::GET, "/")).await.unwrap();
    assert_eq!(root.text_body().unwrap(), "v2");
}

#[tokio::test]
async fn test_queue_survives_restart_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("offline.sqlite3");

    {
        let s = setup_with(
            WorkerConfig::default(),
            CacheStorage::new(),
            LocalDatabase::sqlite(&path, "finance-offline", 1).unwrap(),
        );
        s.network.set_online(false);
        let response = fetch(
            &s.worker,
            mutation(Method::POST, "/api/transactions", r#"{"description":"Coffee","value":5}"#),
        )
        .await;
        assert_eq!(response.status, 202);
    }

    let s = setup_with(
        WorkerConfig::default(),
        CacheStorage::new(),
        LocalDatabase::sqlite(&path, "finance-offline", 1).unwrap(),
    );
    s.network
        .answer(Method::POST, "/api/transactions", Response::new(201, ""));

    let report = sync(&s.worker).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(queue_len(&s.worker).await, 0);
}
