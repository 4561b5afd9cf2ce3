//! Integration tests: drive the wire protocol through a real `TcpListener`
//! against a `Coordinator` wired to an in-memory store, exercising the
//! scenarios from the design's worked examples end to end.

use dispatch_core::codec::{read_frame, write_frame};
use dispatch_core::config::FilterConfig;
use dispatch_core::store::memory::MemoryStore;
use dispatch_core::{FilterRegistry, ResourceStore};
use dispatch_server::coordinator::Coordinator;
use dispatch_server::handler;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

async fn spawn_coordinator(loop_forever: bool, feedback: bool) -> (Arc<Coordinator>, std::net::SocketAddr) {
    let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::default());
    let registry = Arc::new(FilterRegistry::new());
    let coordinator = Arc::new(
        Coordinator::new(store, registry, Vec::<FilterConfig>::new(), feedback, loop_forever).unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepting = coordinator.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.unwrap();
                    let coordinator = accepting.clone();
                    tokio::spawn(handler::handle_connection(coordinator, stream, peer));
                }
                _ = accepting.wait_for_stop_accept() => break,
            }
        }
    });
    (coordinator, addr)
}

async fn connect_client(addr: std::net::SocketAddr, process_id: u32) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, &json!({"type": "client", "processid": process_id}))
        .await
        .unwrap();
    let accepted = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(accepted["command"], "ACCEPTED");
    stream
}

async fn connect_manager(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut stream, &json!({"type": "manager"})).await.unwrap();
    let accepted = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(accepted["command"], "ACCEPTED");
    stream
}

/// Two clients GET_ID concurrently against a two-resource inventory: each
/// gets a distinct resource id, and the inventory is left exhausted.
#[tokio::test]
async fn two_workers_split_the_available_inventory() {
    let (coordinator, addr) = spawn_coordinator(false, false).await;
    coordinator
        .store
        .insert(vec![(Value::from(1), Map::new()), (Value::from(2), Map::new())])
        .await
        .unwrap();

    let mut a = connect_client(addr, 100).await;
    let mut b = connect_client(addr, 101).await;

    write_frame(&mut a, &json!({"command": "GET_ID"})).await.unwrap();
    write_frame(&mut b, &json!({"command": "GET_ID"})).await.unwrap();

    let reply_a = read_frame(&mut a).await.unwrap().unwrap();
    let reply_b = read_frame(&mut b).await.unwrap().unwrap();

    assert_eq!(reply_a["command"], "GIVE_ID");
    assert_eq!(reply_b["command"], "GIVE_ID");
    let mut ids = vec![reply_a["resourceid"].as_i64().unwrap(), reply_b["resourceid"].as_i64().unwrap()];
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    let counts = coordinator.store.count().await.unwrap();
    assert_eq!(counts.available, 0);
    assert_eq!(counts.in_progress, 2);
}

/// A client that leases a resource and then drops the connection without
/// sending EXCEPTION leaves its resource ERROR, not stuck IN_PROGRESS.
#[tokio::test]
async fn dropped_connection_marks_leased_resource_error() {
    let (coordinator, addr) = spawn_coordinator(false, false).await;
    coordinator.store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();

    let mut client = connect_client(addr, 200).await;
    write_frame(&mut client, &json!({"command": "GET_ID"})).await.unwrap();
    let reply = read_frame(&mut client).await.unwrap().unwrap();
    assert_eq!(reply["command"], "GIVE_ID");

    drop(client);
    wait_until(|| async { coordinator.store.count().await.unwrap().in_progress == 0 }).await;

    let counts = coordinator.store.count().await.unwrap();
    assert_eq!(counts.error, 1);
    assert_eq!(counts.in_progress, 0);
}

/// DONE_ID with feedback enabled inserts the worker-discovered resources and
/// marks the completed one SUCCEEDED.
#[tokio::test]
async fn done_id_with_feedback_inserts_new_resources() {
    let (coordinator, addr) = spawn_coordinator(false, true).await;
    coordinator.store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();

    let mut client = connect_client(addr, 300).await;
    write_frame(&mut client, &json!({"command": "GET_ID"})).await.unwrap();
    let _ = read_frame(&mut client).await.unwrap().unwrap();

    write_frame(
        &mut client,
        &json!({
            "command": "DONE_ID",
            "resourceinfo": {"title": "done"},
            "extrainfo": {},
            "newresources": [{"id": 2, "info": {}}, {"id": 3, "info": {}}],
        }),
    )
    .await
    .unwrap();
    let reply = read_frame(&mut client).await.unwrap().unwrap();
    assert_eq!(reply["command"], "DONE_RET");

    let counts = coordinator.store.count().await.unwrap();
    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.total, 3);
    assert_eq!(counts.available, 2);
}

/// RM_CLIENTS with the "all" token disconnects every connected worker, and
/// GET_STATUS afterward reports none still registered.
#[tokio::test]
async fn rm_clients_all_removes_every_worker() {
    let (_coordinator, addr) = spawn_coordinator(true, false).await;

    let mut a = connect_client(addr, 400).await;
    let _b = connect_client(addr, 401).await;

    let mut manager = connect_manager(addr).await;
    write_frame(&mut manager, &json!({"command": "RM_CLIENTS", "clientnames": ["all"]}))
        .await
        .unwrap();
    let reply = read_frame(&mut manager).await.unwrap().unwrap();
    assert_eq!(reply["command"], "RM_RET");
    assert_eq!(reply["successlist"].as_array().unwrap().len(), 2);

    // the next GET_ID each removed worker issues is answered with FINISH.
    write_frame(&mut a, &json!({"command": "GET_ID"})).await.unwrap();
    let finish = read_frame(&mut a).await.unwrap().unwrap();
    assert_eq!(finish["command"], "FINISH");
}

/// RESET on a non-blocking status (FAILED) succeeds even with a worker
/// still connected; RESET on IN_PROGRESS is refused while any are connected.
#[tokio::test]
async fn reset_blocks_only_for_in_progress_or_succeeded_while_connected() {
    let (coordinator, addr) = spawn_coordinator(true, false).await;
    coordinator.store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();
    coordinator
        .store
        .update(0, dispatch_core::types::ResourceStatus::Failed, Map::new())
        .await
        .unwrap();

    let _client = connect_client(addr, 500).await;
    let mut manager = connect_manager(addr).await;

    write_frame(&mut manager, &json!({"command": "RESET", "status": "FAILED"})).await.unwrap();
    let reply = read_frame(&mut manager).await.unwrap().unwrap();
    assert_eq!(reply["fail"], false);
    assert_eq!(reply["count"], 1);

    let mut manager2 = connect_manager(addr).await;
    write_frame(&mut manager2, &json!({"command": "RESET", "status": "INPROGRESS"}))
        .await
        .unwrap();
    let reply2 = read_frame(&mut manager2).await.unwrap().unwrap();
    assert_eq!(reply2["fail"], true);
}

/// GET_STATUS reports server counts and one entry per connected worker.
#[tokio::test]
async fn get_status_reports_counts_and_clients() {
    let (coordinator, addr) = spawn_coordinator(true, false).await;
    coordinator.store.insert(vec![(Value::from(1), Map::new())]).await.unwrap();

    let _client = connect_client(addr, 600).await;
    let mut manager = connect_manager(addr).await;
    write_frame(&mut manager, &json!({"command": "GET_STATUS"})).await.unwrap();
    let reply = read_frame(&mut manager).await.unwrap().unwrap();

    assert_eq!(reply["command"], "GIVE_STATUS");
    assert_eq!(reply["clients"].as_array().unwrap().len(), 1);
    assert_eq!(reply["server"]["counts"]["available"], 1);
}

/// A connection that sends no CONNECT frame before closing is a no-op, not
/// an error surfaced to the accept loop.
#[tokio::test]
async fn empty_connection_is_ignored() {
    let (_coordinator, addr) = spawn_coordinator(true, false).await;
    let stream = TcpStream::connect(addr).await.unwrap();
    drop(stream);
    // give the spawned handler a beat to observe the clean close.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
