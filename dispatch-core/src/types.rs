use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Status of a resource in the inventory. Numeric values match the wire
/// protocol's historical codes so the discriminant can be sent as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum ResourceStatus {
    Succeeded = 2,
    InProgress = 1,
    Available = 0,
    Failed = -1,
    Error = -2,
}

impl ResourceStatus {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            2 => Some(Self::Succeeded),
            1 => Some(Self::InProgress),
            0 => Some(Self::Available),
            -1 => Some(Self::Failed),
            -2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A unit of work in the coordinator's inventory. `key` is an opaque,
/// store-local handle; `id` is the user-visible identifier sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub key: u64,
    pub id: Value,
    pub status: ResourceStatus,
    pub info: Map<String, Value>,
}

/// Aggregate counts returned by `ResourceStore::count`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total: u64,
    pub succeeded: u64,
    pub in_progress: u64,
    pub available: u64,
    pub failed: u64,
    pub error: u64,
}

/// Peer address of a connected worker: hostname, ip, and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// Aggregate timing accounting for a worker, per §4.4.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingAggregates {
    pub server_seconds: f64,
    pub client_seconds: f64,
    pub crawler_seconds: f64,
    pub timing_measures: u64,
    pub crawling_measures: u64,
}

/// The coordinator's record of a connected worker. Mutated only by its own
/// handler task, except for `removal_requested` which is flipped by the
/// management path under `remove_client_lock`.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: u64,
    pub address: PeerAddress,
    pub process_id: u32,
    pub current_resource: Option<(u64, Value)>,
    pub completed_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub timing: TimingAggregates,
    pub removal_requested: bool,
}

impl WorkerRecord {
    pub fn new(id: u64, address: PeerAddress, process_id: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            address,
            process_id,
            current_resource: None,
            completed_count: 0,
            started_at: now,
            last_request_at: None,
            timing: TimingAggregates::default(),
            removal_requested: false,
        }
    }
}

/// Lifecycle of the coordinator. Transitions are one-way:
/// Running -> Finishing -> ShuttingDown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Finishing,
    ShuttingDown,
}

/// One per-handout entry produced by a filter's `apply`.
pub type FilterData = Map<String, Value>;
