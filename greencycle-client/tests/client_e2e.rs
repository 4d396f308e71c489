//! End-to-end tests: real sync server, real client components.
//!
//! Each test starts a server on a free port and drives it through the
//! HTTP sync API, the push socket and the sync agent.

use greencycle_client::{
    ClientConfig, ClientError, ConnectionMonitor, ConnectionState, HttpSyncApi, PushClient,
    PushEvent, RocksQueueStore, Session, SyncAgent, SyncApi, SyncOutcome,
};
use greencycle_core::{ChangeType, EntityType};
use greencycle_realtime::{ServerConfig, SyncServer, TokenPurpose};
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_test_server() -> (Arc<SyncServer>, SocketAddr) {
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, addr)
}

fn session_for(server: &SyncServer, user: &str) -> Session {
    Session::with_token(server.tokens().issue(user, "user", TokenPurpose::Access).unwrap())
}

fn open_agent(config: &ClientConfig, session: Session, dir: &Path) -> SyncAgent {
    let api = Arc::new(HttpSyncApi::new(config, session).unwrap());
    let store = Arc::new(RocksQueueStore::open(dir).unwrap());
    SyncAgent::open(api, store, config.entity_types.clone()).unwrap()
}

async fn next_sync_event(events: &mut mpsc::Receiver<PushEvent>) -> PushEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event @ PushEvent::Sync { .. }) => return event,
                Some(_) => continue,
                None => panic!("push client closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

#[tokio::test]
async fn test_agent_round_trip_between_two_users() {
    let (server, addr) = start_test_server().await;
    let url = format!("http://{addr}");
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config_a = ClientConfig::for_testing(url.clone(), dir_a.path());
    let alice = open_agent(&config_a, session_for(&server, "alice"), dir_a.path());
    alice
        .queue_update(
            EntityType::Collections,
            ChangeType::Create,
            Some("c1".into()),
            json!({ "material": "glass", "kg": 3 }),
        )
        .unwrap();

    let outcome = alice.perform_sync().await.unwrap();
    match outcome {
        SyncOutcome::Completed(report) => {
            assert_eq!(report.pushed, 1);
            assert_eq!(report.rejected, 0);
            assert_eq!(report.pulled, 1);
        }
        SyncOutcome::Skipped => panic!("nothing else was syncing"),
    }
    assert_eq!(alice.pending_count(), 0);
    assert!(alice.local_record(EntityType::Collections, "c1").unwrap().confirmed);
    assert!(alice.cursor(EntityType::Collections) > 0);

    let config_b = ClientConfig::for_testing(url, dir_b.path());
    let bob = open_agent(&config_b, session_for(&server, "bob"), dir_b.path());
    bob.perform_sync().await.unwrap();
    let record = bob.local_record(EntityType::Collections, "c1").unwrap();
    assert_eq!(record.data["material"], "glass");
}

#[tokio::test]
async fn test_rejected_update_stays_queued() {
    let (server, addr) = start_test_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig::for_testing(format!("http://{addr}"), dir.path());
    let agent = open_agent(&config, session_for(&server, "alice"), dir.path());

    agent
        .queue_update(EntityType::Marketplace, ChangeType::Create, Some("m1".into()), json!({ "price": 5 }))
        .unwrap();
    agent
        .queue_update(EntityType::Marketplace, ChangeType::Update, Some("ghost".into()), json!({ "price": 1 }))
        .unwrap();

    let outcome = agent.perform_sync().await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Completed(ref report) if report.pushed == 1 && report.rejected == 1
    ));
    let left = agent.pending();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id.as_deref(), Some("ghost"));
}

#[tokio::test]
async fn test_signed_out_sync_keeps_queue() {
    let (_server, addr) = start_test_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig::for_testing(format!("http://{addr}"), dir.path());
    let agent = open_agent(&config, Session::new(), dir.path());

    agent
        .queue_update(EntityType::Users, ChangeType::Create, Some("u1".into()), json!({}))
        .unwrap();
    let err = agent.perform_sync().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthenticated));
    assert_eq!(agent.pending_count(), 1);
    assert!(agent.status().error.is_some());
}

#[tokio::test]
async fn test_queue_survives_restart_and_flushes_later() {
    let dir = tempfile::tempdir().unwrap();

    // A port nobody listens on.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    {
        let config = ClientConfig::for_testing(format!("http://{dead_addr}"), dir.path());
        let agent = open_agent(&config, Session::with_token("irrelevant"), dir.path());
        agent
            .queue_update(EntityType::Transactions, ChangeType::Create, Some("t1".into()), json!({ "amount": 12 }))
            .unwrap();
        assert!(matches!(agent.perform_sync().await, Err(ClientError::Network(_))));
        assert_eq!(agent.pending_count(), 1);
    }

    let (server, addr) = start_test_server().await;
    let config = ClientConfig::for_testing(format!("http://{addr}"), dir.path());
    let agent = open_agent(&config, session_for(&server, "carol"), dir.path());
    assert_eq!(agent.pending_count(), 1);

    agent.perform_sync().await.unwrap();
    assert_eq!(agent.pending_count(), 0);
    let pulled = server.reconciliation().pull(EntityType::Transactions, 0).unwrap();
    assert_eq!(pulled.data.len(), 1);
    assert_eq!(pulled.data[0].id, "t1");
}

#[tokio::test]
async fn test_push_client_receives_sync_nudge() {
    let (server, addr) = start_test_server().await;
    let url = format!("http://{addr}");
    let dir = tempfile::tempdir().unwrap();

    let watcher = PushClient::new(ClientConfig::for_testing(url.clone(), dir.path()), session_for(&server, "bob"));
    let mut events = watcher.take_event_rx().unwrap();
    watcher.connect().await.unwrap();
    assert_eq!(watcher.state(), ConnectionState::Connected);

    let ack = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
    assert!(matches!(ack, PushEvent::Connected { connection_id: Some(_) }));

    let config = ClientConfig::for_testing(url, dir.path().join("alice"));
    let api = HttpSyncApi::new(&config, session_for(&server, "alice")).unwrap();
    let update = greencycle_core::UpdateRequest {
        id: Some("c9".into()),
        data: json!({ "kg": 1 }),
        operation: ChangeType::Create,
    };
    // The ack is sent after registration.
    assert_eq!(server.registry().len(), 1);
    api.push(EntityType::Collections, vec![update]).await.unwrap();

    match next_sync_event(&mut events).await {
        PushEvent::Sync {
            entity_type,
            change_type,
            changes,
            ..
        } => {
            assert_eq!(entity_type, EntityType::Collections);
            assert_eq!(change_type, ChangeType::Create);
            assert_eq!(changes[0]["id"], "c9");
        }
        other => panic!("unexpected event {other:?}"),
    }

    watcher.disconnect().await;
    assert_eq!(watcher.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_status_is_fetched_and_cached() {
    let (server, addr) = start_test_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig::for_testing(format!("http://{addr}"), dir.path());
    let api = HttpSyncApi::new(&config, session_for(&server, "alice")).unwrap();

    let first = api.status().await.unwrap();
    assert_eq!(first.status, "online");
    assert_eq!(first.statistics[&EntityType::Users], 0);

    api.push(
        EntityType::Users,
        vec![greencycle_core::UpdateRequest {
            id: Some("u1".into()),
            data: json!({}),
            operation: ChangeType::Create,
        }],
    )
    .await
    .unwrap();

    let cached = api.status().await.unwrap();
    assert_eq!(cached, first);

    api.invalidate_status();
    let fresh = api.status().await.unwrap();
    assert_eq!(fresh.statistics[&EntityType::Users], 1);
}

#[tokio::test]
async fn test_monitor_manual_reconnect() {
    let (server, addr) = start_test_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ClientConfig::for_testing(format!("http://{addr}"), dir.path());

    let session = Session::with_token("not-a-token");
    let client = Arc::new(PushClient::new(config.clone(), session.clone()));
    let monitor = ConnectionMonitor::new(client.clone(), config.monitor_interval);
    assert_eq!(monitor.status(), ConnectionState::Disconnected);

    let err = monitor.reconnect().await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthenticated));
    assert_eq!(monitor.status(), ConnectionState::Error);
    assert!(server.registry().is_empty());

    session.set_token(Some(server.tokens().issue("dana", "user", TokenPurpose::Access).unwrap()));
    monitor.reconnect().await.unwrap();
    assert_eq!(monitor.status(), ConnectionState::Connected);
    assert_eq!(monitor.poll_once(), ConnectionState::Connected);

    client.disconnect().await;
    assert_eq!(monitor.poll_once(), ConnectionState::Disconnected);
}
