pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod store;
pub mod types;

pub use config::Configuration;
pub use error::{CoordinatorError, Result};
pub use filter::{build_pipeline, Filter, FilterPipeline, FilterRegistry};
pub use store::{build_store, ResourceStore};
pub use types::{LifecycleState, PeerAddress, Resource, ResourceStatus, StoreCounts, WorkerRecord};
