use chrono::{DateTime, Utc};
use dispatch_core::config::FilterConfig;
use dispatch_core::{
    build_pipeline, CoordinatorError, FilterPipeline, FilterRegistry, LifecycleState, PeerAddress,
    ResourceStore, WorkerRecord,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

/// A registered worker plus the bookkeeping the management surface needs
/// without reaching into the owning handler task: a removal flag it
/// watches at its next GET_ID boundary, and an alive flag flipped just
/// before the handler performs its own cleanup.
struct WorkerEntry {
    record: WorkerRecord,
    removal_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

/// Handle for a worker's own task to report back into the registry without
/// holding the workers map lock for the connection's lifetime.
pub struct WorkerHandle {
    pub id: u64,
    pub removal_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

/// Global coordinator state: lifecycle, worker registry, and the shared
/// store/filter configuration every connection handler draws on. Named
/// locks from §5 (`nextFreeIDLock`, `removeClientLock`, `shutdownLock`)
/// are explicit `Mutex` fields rather than implicit monitor locks.
pub struct Coordinator {
    pub store: Arc<dyn ResourceStore>,
    pub filter_registry: Arc<FilterRegistry>,
    pub filter_configs: Vec<FilterConfig>,
    pub feedback: bool,
    pub loop_forever: bool,
    pub started_at: DateTime<Utc>,
    pub process_id: u32,

    state: RwLock<LifecycleState>,
    workers: RwLock<HashMap<u64, WorkerEntry>>,
    next_id_lock: Mutex<u64>,
    remove_client_lock: Mutex<()>,
    shutdown_lock: Mutex<()>,
    active_connections: AtomicU64,
    finished: Notify,
    stop_accept: Notify,
    /// A process-lifetime filter roster, distinct from the per-connection
    /// instances the handler builds for hand-out/callback hooks, used only
    /// to give `shutdown()` a single process-wide call site per filter.
    shutdown_pipeline: Mutex<FilterPipeline>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        filter_registry: Arc<FilterRegistry>,
        filter_configs: Vec<FilterConfig>,
        feedback: bool,
        loop_forever: bool,
    ) -> Result<Self, CoordinatorError> {
        let shutdown_pipeline = build_pipeline(&filter_configs, &filter_registry)?;
        Ok(Self {
            store,
            filter_registry,
            filter_configs,
            feedback,
            loop_forever,
            started_at: Utc::now(),
            process_id: std::process::id(),
            state: RwLock::new(LifecycleState::Running),
            workers: RwLock::new(HashMap::new()),
            next_id_lock: Mutex::new(1),
            remove_client_lock: Mutex::new(()),
            shutdown_lock: Mutex::new(()),
            active_connections: AtomicU64::new(0),
            finished: Notify::new(),
            stop_accept: Notify::new(),
            shutdown_pipeline: Mutex::new(shutdown_pipeline),
        })
    }

    pub fn notify_stop_accept(&self) {
        self.stop_accept.notify_waiters();
    }

    pub async fn wait_for_stop_accept(&self) {
        self.stop_accept.notified().await;
    }

    pub async fn has_connected_workers(&self) -> bool {
        !self.workers.read().await.is_empty()
    }

    /// Process-wide teardown: each filter's `shutdown`, then the store's.
    pub async fn shutdown_shared(&self) -> Result<(), CoordinatorError> {
        self.shutdown_pipeline.lock().await.shutdown().await?;
        self.store.shutdown().await
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Registers a new worker and returns its handle. Assigns the next id
    /// under `nextFreeIDLock`.
    pub async fn register_worker(&self, address: PeerAddress, process_id: u32) -> WorkerHandle {
        let id = {
            let mut guard = self.next_id_lock.lock().await;
            let id = *guard;
            *guard += 1;
            id
        };
        let removal_requested = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));
        let record = WorkerRecord::new(id, address, process_id, Utc::now());
        self.workers.write().await.insert(
            id,
            WorkerEntry {
                record,
                removal_requested: removal_requested.clone(),
                alive: alive.clone(),
            },
        );
        WorkerHandle {
            id,
            removal_requested,
            alive,
        }
    }

    /// Applies a mutation to a worker's record, e.g. after GET_ID/DONE_ID.
    pub async fn with_worker_mut<F: FnOnce(&mut WorkerRecord)>(&self, id: u64, f: F) {
        if let Some(entry) = self.workers.write().await.get_mut(&id) {
            f(&mut entry.record);
        }
    }

    /// Marks a worker's handler as exited (a brief window during which
    /// `"disconnected"` may select it) and drops its record.
    pub async fn deregister_worker(&self, handle: &WorkerHandle) {
        handle.alive.store(false, Ordering::SeqCst);
        let _guard = self.remove_client_lock.lock().await;
        self.workers.write().await.remove(&handle.id);
        self.finished.notify_waiters();
    }

    /// Flags every currently-registered worker for removal (shutdown and
    /// the exhausted-`loopForever=false` path both do this).
    pub async fn mark_all_for_removal(&self) {
        let _guard = self.remove_client_lock.lock().await;
        for entry in self.workers.read().await.values() {
            entry.removal_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Resolves `RM_CLIENTS`'s id/name set per §4.4: `"all"` selects every
    /// registered worker, `"disconnected"` selects workers whose handler
    /// has exited, any other token matches a worker's hostname.
    pub async fn resolve_removal_targets(&self, ids: &[u64], names: &[String]) -> Vec<u64> {
        let workers = self.workers.read().await;
        let mut resolved: Vec<u64> = ids.iter().copied().filter(|id| workers.contains_key(id)).collect();
        for name in names {
            match name.as_str() {
                "all" => resolved.extend(workers.keys().copied()),
                "disconnected" => resolved.extend(
                    workers
                        .iter()
                        .filter(|(_, e)| !e.alive.load(Ordering::SeqCst))
                        .map(|(id, _)| *id),
                ),
                hostname => resolved.extend(
                    workers
                        .iter()
                        .filter(|(_, e)| e.record.address.hostname == hostname)
                        .map(|(id, _)| *id),
                ),
            }
        }
        resolved.sort_unstable();
        resolved.dedup();
        resolved
    }

    /// Sets the removal flag for `id` if a handler is registered for it.
    /// Returns whether a live entry was found.
    pub async fn request_removal(&self, id: u64) -> bool {
        let _guard = self.remove_client_lock.lock().await;
        match self.workers.read().await.get(&id) {
            Some(entry) => {
                entry.removal_requested.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Waits until `id` is no longer registered, for `RM_CLIENTS`'s
    /// "wait until every resolved id has been dropped" step.
    pub async fn wait_for_removal(&self, id: u64) {
        loop {
            // Registered before the condition check: a `notify_waiters()`
            // fired between the check and the await is still observed, so
            // deregister_worker can never signal into an empty waiter set.
            let notified = self.finished.notified();
            if !self.workers.read().await.contains_key(&id) {
                return;
            }
            notified.await;
        }
    }

    /// One-way transition `running -> finishing`, under `shutdownLock`.
    /// Returns whether this call performed the transition.
    pub async fn try_begin_finishing(&self) -> bool {
        let _guard = self.shutdown_lock.lock().await;
        let mut state = self.state.write().await;
        if *state == LifecycleState::Running {
            *state = LifecycleState::Finishing;
            true
        } else {
            false
        }
    }

    /// One-way transition to `shutting-down`, under `shutdownLock`. Fails
    /// (returning the current state) if already `shutting-down`.
    pub async fn try_begin_shutdown(&self) -> Result<(), LifecycleState> {
        let _guard = self.shutdown_lock.lock().await;
        let mut state = self.state.write().await;
        if *state == LifecycleState::ShuttingDown {
            return Err(*state);
        }
        *state = LifecycleState::ShuttingDown;
        Ok(())
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.finished.notify_waiters();
    }

    /// Blocks the clean-up thread until it is the sole remaining
    /// connection, per §4.4's finalization step.
    pub async fn wait_until_sole_connection(&self) {
        loop {
            let notified = self.finished.notified();
            if self.active_connections.load(Ordering::SeqCst) <= 1 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of every registered worker's status fields, for
    /// `GET_STATUS`.
    pub async fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .read()
            .await
            .values()
            .map(|entry| WorkerSnapshot {
                record: entry.record.clone(),
                thread_state: if entry.removal_requested.load(Ordering::SeqCst) {
                    -1
                } else if entry.alive.load(Ordering::SeqCst) {
                    0
                } else {
                    -2
                },
            })
            .collect()
    }
}

/// A point-in-time copy of a worker record plus its thread-state code
/// (0=alive, -1=removal-pending, -2=dead), per §4.4's `GET_STATUS` payload.
pub struct WorkerSnapshot {
    pub record: WorkerRecord,
    pub thread_state: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::store::memory::MemoryStore;

    fn address(hostname: &str) -> PeerAddress {
        PeerAddress {
            hostname: hostname.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            port: 9000,
        }
    }

    fn coordinator() -> Coordinator {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::default());
        let registry = Arc::new(FilterRegistry::new());
        Coordinator::new(store, registry, Vec::new(), false, false).unwrap()
    }

    /// register_worker assigns strictly increasing ids, and deregister_worker
    /// drops the record entirely.
    #[tokio::test]
    async fn register_then_deregister_removes_the_record() {
        let c = coordinator();
        let h1 = c.register_worker(address("a"), 1).await;
        let h2 = c.register_worker(address("b"), 2).await;
        assert_eq!(h2.id, h1.id + 1);
        assert!(c.has_connected_workers().await);

        c.deregister_worker(&h1).await;
        let remaining = c.worker_snapshots().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record.id, h2.id);
    }

    /// resolve_removal_targets expands "all" to every registered id and
    /// leaves an unregistered explicit id out of the resolved set.
    #[tokio::test]
    async fn resolve_removal_targets_expands_all_token() {
        let c = coordinator();
        let h1 = c.register_worker(address("a"), 1).await;
        let h2 = c.register_worker(address("b"), 2).await;

        let mut targets = c.resolve_removal_targets(&[999], &["all".to_string()]).await;
        targets.sort_unstable();
        assert_eq!(targets, vec![h1.id, h2.id]);
    }

    /// resolve_removal_targets matches a bare token against worker hostname.
    #[tokio::test]
    async fn resolve_removal_targets_matches_hostname() {
        let c = coordinator();
        let h1 = c.register_worker(address("crawler-1"), 1).await;
        let _h2 = c.register_worker(address("crawler-2"), 2).await;

        let targets = c.resolve_removal_targets(&[], &["crawler-1".to_string()]).await;
        assert_eq!(targets, vec![h1.id]);
    }

    /// the running -> finishing -> shutting-down transition is one-way and
    /// each step only succeeds once.
    #[tokio::test]
    async fn lifecycle_transitions_are_one_way() {
        let c = coordinator();
        assert_eq!(c.state().await, LifecycleState::Running);
        assert!(c.try_begin_finishing().await);
        assert!(!c.try_begin_finishing().await);
        assert_eq!(c.state().await, LifecycleState::Finishing);

        assert!(c.try_begin_shutdown().await.is_ok());
        assert_eq!(c.state().await, LifecycleState::ShuttingDown);
        assert!(c.try_begin_shutdown().await.is_err());
    }
}
