use crate::coordinator::{Coordinator, WorkerHandle};
use chrono::Utc;
use dispatch_core::codec::{read_frame, write_frame};
use dispatch_core::types::ResourceStatus;
use dispatch_core::{build_pipeline, LifecycleState, PeerAddress};
use dispatch_core::{CoordinatorError, FilterPipeline};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

/// Whether a client verb loop iteration should keep reading frames or end
/// the connection, returned by `dispatch_client_command` so timing
/// accounting runs for every request regardless of which branch it takes.
enum ClientOutcome {
    Continue,
    Exit,
}

/// Drives one accepted connection end to end: `CONNECT` gating, the
/// client or manager verb loop, and the shared finish sequence. Never
/// propagates a panic into the accept loop; any error here ends only this
/// connection (§7).
pub async fn handle_connection(coordinator: Arc<Coordinator>, mut stream: TcpStream, peer: SocketAddr) {
    coordinator.connection_opened();
    if let Err(err) = run_connection(&coordinator, &mut stream, peer).await {
        tracing::warn!(error = %err, peer = %peer, "connection ended with error");
    }
    coordinator.connection_closed();
}

async fn run_connection(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    peer: SocketAddr,
) -> Result<(), CoordinatorError> {
    let Some(connect) = read_frame(stream).await? else {
        return Ok(());
    };
    let connection_type = connect
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CoordinatorError::Protocol("CONNECT missing type".into()))?;
    let process_id = connect
        .get("processid")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    if coordinator.state().await != LifecycleState::Running {
        let reason = format!("server is {:?}", coordinator.state().await);
        write_frame(stream, &json!({"command": "REFUSED", "reason": reason})).await?;
        return Ok(());
    }

    coordinator.store.setup().await?;

    match connection_type {
        "client" => run_client(coordinator, stream, peer, process_id).await,
        "manager" => run_manager(coordinator, stream).await,
        other => Err(CoordinatorError::Protocol(format!(
            "unknown CONNECT type: {other}"
        ))),
    }
}

async fn run_client(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    peer: SocketAddr,
    process_id: u32,
) -> Result<(), CoordinatorError> {
    let pipeline = build_pipeline(&coordinator.filter_configs, &coordinator.filter_registry)?;
    pipeline.setup().await?;

    let address = PeerAddress {
        hostname: peer.ip().to_string(),
        ip: peer.ip(),
        port: peer.port(),
    };
    let handle = coordinator.register_worker(address, process_id).await;
    write_frame(stream, &json!({"command": "ACCEPTED", "clientid": handle.id})).await?;

    let result = client_loop(coordinator, stream, &handle, &pipeline).await;

    let finish_result = pipeline.finish().await;
    coordinator.store.finish().await?;
    coordinator.deregister_worker(&handle).await;
    finish_result?;
    result
}

async fn client_loop(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    handle: &WorkerHandle,
    pipeline: &FilterPipeline,
) -> Result<(), CoordinatorError> {
    loop {
        let wait_started = Instant::now();
        let Some(request) = read_frame(stream).await? else {
            // peer dropped the connection without EXCEPTION(error); if it
            // held a lease, the lease is abandoned as ERROR per §5.
            mark_abandoned_lease_error(coordinator, handle).await?;
            return Ok(());
        };
        let client_seconds = wait_started.elapsed().as_secs_f64();
        let command = request
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinatorError::Protocol("missing command".into()))?
            .to_string();
        let is_crawler_verb = matches!(command.as_str(), "DONE_ID" | "EXCEPTION");

        let dispatch_started = Instant::now();
        let outcome = dispatch_client_command(coordinator, stream, handle, pipeline, &command, &request).await;
        let server_seconds = dispatch_started.elapsed().as_secs_f64();

        coordinator
            .with_worker_mut(handle.id, |w| {
                w.timing.client_seconds += client_seconds;
                w.timing.server_seconds += server_seconds;
                w.timing.timing_measures += 1;
                if is_crawler_verb {
                    w.timing.crawler_seconds += client_seconds;
                    w.timing.crawling_measures += 1;
                }
            })
            .await;

        match outcome? {
            ClientOutcome::Continue => {}
            ClientOutcome::Exit => return Ok(()),
        }
    }
}

async fn dispatch_client_command(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    handle: &WorkerHandle,
    pipeline: &FilterPipeline,
    command: &str,
    request: &Value,
) -> Result<ClientOutcome, CoordinatorError> {
    match command {
        "GET_ID" => {
            coordinator
                .with_worker_mut(handle.id, |w| {
                    w.current_resource = None;
                    w.last_request_at = Some(Utc::now());
                })
                .await;

            if handle.removal_requested.load(Ordering::SeqCst) {
                let reason = match coordinator.state().await {
                    LifecycleState::Running => "removed",
                    LifecycleState::Finishing => "task done",
                    LifecycleState::ShuttingDown => "shut down",
                };
                write_frame(stream, &json!({"command": "FINISH", "reason": reason})).await?;
                return Ok(ClientOutcome::Exit);
            }

            match coordinator.store.select().await? {
                Some((key, id, info)) => {
                    let filters = pipeline.apply(&id, &info).await?;
                    coordinator
                        .with_worker_mut(handle.id, |w| w.current_resource = Some((key, id.clone())))
                        .await;
                    write_frame(
                        stream,
                        &json!({"command": "GIVE_ID", "resourceid": id, "filters": filters}),
                    )
                    .await?;
                }
                None if coordinator.loop_forever => {
                    sleep(Duration::from_secs(5)).await;
                }
                None => {
                    if coordinator.try_begin_finishing().await {
                        coordinator.mark_all_for_removal().await;
                    }
                }
            }
            Ok(ClientOutcome::Continue)
        }
        "DONE_ID" => {
            handle_done_id(coordinator, stream, handle, pipeline, request).await?;
            Ok(ClientOutcome::Continue)
        }
        "EXCEPTION" => {
            let kind = request.get("type").and_then(Value::as_str).unwrap_or("error");
            let Some((key, _)) = current_resource(coordinator, handle.id).await else {
                return Err(CoordinatorError::Protocol(
                    "EXCEPTION with no leased resource".into(),
                ));
            };
            if kind == "fail" {
                coordinator.store.update(key, ResourceStatus::Failed, Map::new()).await?;
                write_frame(stream, &json!({"command": "EXCEPTION_RET"})).await?;
                Ok(ClientOutcome::Continue)
            } else {
                coordinator.store.update(key, ResourceStatus::Error, Map::new()).await?;
                Ok(ClientOutcome::Exit)
            }
        }
        other => Err(CoordinatorError::Protocol(format!("unexpected verb: {other}"))),
    }
}

async fn handle_done_id(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    handle: &WorkerHandle,
    pipeline: &FilterPipeline,
    request: &Value,
) -> Result<(), CoordinatorError> {
    let Some((key, id)) = current_resource(coordinator, handle.id).await else {
        return Err(CoordinatorError::Protocol("DONE_ID with no leased resource".into()));
    };
    let mut resource_info = request
        .get("resourceinfo")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let extra_info = request
        .get("extrainfo")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let mut new_resources: Vec<(Value, Map<String, Value>)> = request
        .get("newresources")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| {
                    let id = entry.get("id")?.clone();
                    let info = entry.get("info").and_then(|v| v.as_object().cloned()).unwrap_or_default();
                    Some((id, info))
                })
                .collect()
        })
        .unwrap_or_default();

    pipeline
        .callback(&id, &mut resource_info, &mut new_resources, &extra_info)
        .await?;

    if coordinator.feedback && !new_resources.is_empty() {
        coordinator.store.insert(new_resources).await?;
    }
    coordinator.store.update(key, ResourceStatus::Succeeded, resource_info).await?;
    coordinator
        .with_worker_mut(handle.id, |w| w.completed_count += 1)
        .await;
    write_frame(stream, &json!({"command": "DONE_RET"})).await?;
    Ok(())
}

async fn current_resource(coordinator: &Arc<Coordinator>, id: u64) -> Option<(u64, Value)> {
    let mut out = None;
    coordinator
        .with_worker_mut(id, |w| out = w.current_resource.clone())
        .await;
    out
}

/// A socket that closes mid-lease (no EXCEPTION frame) leaves its leased
/// resource ERROR, per scenario 2.
async fn mark_abandoned_lease_error(
    coordinator: &Arc<Coordinator>,
    handle: &WorkerHandle,
) -> Result<(), CoordinatorError> {
    if let Some((key, _)) = current_resource(coordinator, handle.id).await {
        coordinator.store.update(key, ResourceStatus::Error, Map::new()).await?;
    }
    Ok(())
}

async fn handle_reset(
    coordinator: &Arc<Coordinator>,
    stream: &mut TcpStream,
    request: &Value,
) -> Result<(), CoordinatorError> {
    let status = request.get("status").and_then(Value::as_str).unwrap_or("");
    let parsed = match status {
        "INPROGRESS" => Some(ResourceStatus::InProgress),
        "FAILED" => Some(ResourceStatus::Failed),
        "ERROR" => Some(ResourceStatus::Error),
        "SUCCEEDED" => Some(ResourceStatus::Succeeded),
        _ => None,
    };
    let Some(status) = parsed else {
        return write_frame(
            stream,
            &json!({"command": "RESET_RET", "fail": true, "reason": "unknown status"}),
        )
        .await;
    };
    let blocks_on_connected_workers =
        matches!(status, ResourceStatus::InProgress | ResourceStatus::Succeeded);
    if blocks_on_connected_workers && coordinator.has_connected_workers().await {
        return write_frame(
            stream,
            &json!({
                "command": "RESET_RET",
                "fail": true,
                "reason": "cannot reset IN_PROGRESS/SUCCEEDED while workers are connected",
            }),
        )
        .await;
    }
    let count = coordinator.store.reset(status).await?;
    write_frame(stream, &json!({"command": "RESET_RET", "fail": false, "count": count})).await
}

async fn run_manager(coordinator: &Arc<Coordinator>, stream: &mut TcpStream) -> Result<(), CoordinatorError> {
    write_frame(stream, &json!({"command": "ACCEPTED", "clientid": 0})).await?;

    let Some(request) = read_frame(stream).await? else {
        coordinator.store.finish().await?;
        return Ok(());
    };
    let command = request
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| CoordinatorError::Protocol("missing command".into()))?;

    let mut is_cleanup_thread = false;

    match command {
        "GET_STATUS" => {
            let snapshots = coordinator.worker_snapshots().await;
            let clients: Vec<Value> = snapshots
                .iter()
                .map(|s| {
                    json!({
                        "clientid": s.record.id,
                        "threadstate": s.thread_state,
                        "address": {
                            "hostname": s.record.address.hostname,
                            "ip": s.record.address.ip.to_string(),
                            "port": s.record.address.port,
                        },
                        "pid": s.record.process_id,
                        "time": {
                            "start": s.record.started_at.timestamp(),
                            "lastrequest": s.record.last_request_at.map(|t| t.timestamp()),
                        },
                        "resourceid": s.record.current_resource.as_ref().map(|(_, id)| id.clone()),
                        "amount": s.record.completed_count,
                        "agrserver": s.record.timing.server_seconds,
                        "agrclient": s.record.timing.client_seconds,
                        "agrcrawler": s.record.timing.crawler_seconds,
                        "timingmeasures": s.record.timing.timing_measures,
                        "crawlingmeasures": s.record.timing.crawling_measures,
                    })
                })
                .collect();
            let counts = coordinator.store.count().await?;
            let server = json!({
                "pid": coordinator.process_id,
                "state": format!("{:?}", coordinator.state().await),
                "counts": {
                    "total": counts.total,
                    "succeeded": counts.succeeded,
                    "inprogress": counts.in_progress,
                    "available": counts.available,
                    "failed": counts.failed,
                    "error": counts.error,
                },
                "time": {
                    "start": coordinator.started_at.timestamp(),
                    "current": Utc::now().timestamp(),
                },
            });
            write_frame(
                stream,
                &json!({"command": "GIVE_STATUS", "clients": clients, "server": server}),
            )
            .await?;
        }
        "RM_CLIENTS" => {
            let ids: Vec<u64> = request
                .get("clientids")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();
            let names: Vec<String> = request
                .get("clientnames")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let targets = coordinator.resolve_removal_targets(&ids, &names).await;
            let mut success = Vec::new();
            let mut errors = Vec::new();
            for id in &ids {
                if !targets.contains(id) {
                    errors.push(*id);
                }
            }
            for id in targets {
                coordinator.request_removal(id).await;
                coordinator.wait_for_removal(id).await;
                success.push(id);
            }
            write_frame(
                stream,
                &json!({"command": "RM_RET", "successlist": success, "errorlist": errors}),
            )
            .await?;
        }
        "RESET" => handle_reset(coordinator, stream, &request).await?,
        "SHUTDOWN" => match coordinator.try_begin_shutdown().await {
            Err(state) => {
                write_frame(
                    stream,
                    &json!({"command": "SD_RET", "fail": true, "reason": format!("{state:?}")}),
                )
                .await?;
            }
            Ok(()) => {
                coordinator.mark_all_for_removal().await;
                is_cleanup_thread = true;
            }
        },
        other => return Err(CoordinatorError::Protocol(format!("unexpected verb: {other}"))),
    }

    coordinator.store.finish().await?;

    if is_cleanup_thread {
        coordinator.wait_until_sole_connection().await;
        coordinator.notify_stop_accept();
        coordinator.shutdown_shared().await?;
        write_frame(stream, &json!({"command": "SD_RET", "fail": false})).await?;
    }

    Ok(())
}
