//! Integration tests for the counter service client and the tracking service
//!
//! The HTTP transport runs against a `wiremock` server speaking the counter
//! service protocol; persistence tests use a real SQLite file in a temp dir.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use usagesync_core::config::{CollectorConfig, RulesConfig, TrackingConfig};
use usagesync_core::transport::{AddOutcome, AddRequest};
use usagesync_core::{
    CounterTransport, Decision, Error, HttpTransport, MemoryTransport, Observation,
    PendingAggregator, RuleSet, SqliteStore, SyncEngine, Tracker,
};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn collector(server: &MockServer) -> CollectorConfig {
    CollectorConfig {
        enabled: true,
        server_url: Some(server.uri()),
        api_key: Some("test-key".to_string()),
        ..Default::default()
    }
}

fn add_request(seq: u64) -> AddRequest {
    AddRequest {
        client_id: "client-a".to_string(),
        seq,
        deltas: BTreeMap::from([("chatgpt.com".to_string(), 3)]),
        ts: 1_700_000_000_000,
    }
}

fn rules() -> RuleSet {
    let config: RulesConfig = toml::from_str(
        r#"
        [allow]
        "*.chat.test" = ['^/api/send']
        "#,
    )
    .unwrap();
    RuleSet::from_config(&config).unwrap()
}

// ============================================
// HTTP transport
// ============================================

#[tokio::test]
async fn test_status_returns_last_seq() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(query_param("client_id", "client-a"))
        .and(header("X-API-KEY", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "last_seq": 41 })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    assert_eq!(transport.last_applied("client-a").await.unwrap(), 41);
}

#[tokio::test]
async fn test_add_applied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .and(header("X-API-KEY", "test-key"))
        .and(body_partial_json(json!({
            "client_id": "client-a",
            "seq": 1,
            "deltas": { "chatgpt.com": 3 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "last_seq": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    assert_eq!(
        transport.add(&add_request(1)).await.unwrap(),
        AddOutcome::Applied { last_seq: 1 }
    );
}

#[tokio::test]
async fn test_add_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({ "error": "seq", "expected_next": 8 })),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    assert_eq!(
        transport.add(&add_request(3)).await.unwrap(),
        AddOutcome::Conflict { expected_next: 8 }
    );
}

#[tokio::test]
async fn test_server_error_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    let err = transport.add(&add_request(1)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(ref msg) if msg.contains("boom")));
}

#[tokio::test]
async fn test_malformed_conflict_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .respond_with(ResponseTemplate::new(409).set_body_string("not json"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    assert!(matches!(
        transport.add(&add_request(1)).await,
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn test_counters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/counters"))
        .and(query_param("client_id", "client-a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "counters": { "chatgpt.com": 12, "t3.chat": 2 } })),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(&collector(&server)).unwrap();
    let counters = transport.counters("client-a").await.unwrap();
    assert_eq!(counters.get("chatgpt.com"), Some(&12));
    assert_eq!(counters.len(), 2);
}

#[tokio::test]
async fn test_unreachable_server_is_transport_error() {
    let config = CollectorConfig {
        enabled: true,
        server_url: Some("http://127.0.0.1:1".to_string()),
        timeout_secs: 1,
        ..Default::default()
    };
    let transport = HttpTransport::new(&config).unwrap();
    assert!(matches!(
        transport.last_applied("client-a").await,
        Err(Error::Transport(_))
    ));
}

// ============================================
// Service over HTTP
// ============================================

/// Wait until the startup handshake has adopted the server's seq
async fn wait_for_seq(tracker: &Tracker, seq: u64) {
    for _ in 0..100 {
        if tracker.status().await.unwrap().seq == seq {
            // Let the service observe the handshake completion
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("handshake did not complete");
}

#[tokio::test]
async fn test_tracker_flushes_over_http_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "last_seq": 4 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/add"))
        .and(body_partial_json(json!({ "seq": 5, "deltas": { "www.chat.test": 2 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "last_seq": 5 })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let transport = Arc::new(HttpTransport::new(&collector(&server)).unwrap());
    let tracker = Tracker::start(&TrackingConfig::default(), store, transport, rules()).unwrap();
    wait_for_seq(&tracker, 4).await;

    for scope in ["tab-1", "tab-2"] {
        let decision = tracker
            .observe(Observation::new("POST", "https://www.chat.test/api/send", scope))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Counted);
    }

    let status = tracker.shutdown().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(status.seq, 5);
}

// ============================================
// Persistence
// ============================================

#[tokio::test]
async fn test_state_survives_restart() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("state.db");
    let transport = Arc::new(MemoryTransport::new());

    let client_id = {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let engine = SyncEngine::open(store.clone(), transport.clone()).unwrap();
        let pending = PendingAggregator::load(store).unwrap();
        pending.increment("www.chat.test", 3).unwrap();
        engine.client_id().to_string()
    };

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let tracker =
        Tracker::start(&TrackingConfig::default(), store, transport.clone(), rules()).unwrap();
    assert_eq!(tracker.client_id(), client_id);

    let status = tracker.shutdown().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(transport.ledger().unwrap().total("www.chat.test"), 3);

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine = SyncEngine::open(store, transport).unwrap();
    assert_eq!(engine.client_id(), client_id);
    assert_eq!(engine.seq(), 1);
}
