//! Cluster coordination: CAS document store, leases and leader election

pub mod leader;
pub mod lease;
pub mod store;

pub use leader::{LeaderConfig, LeaderElector, LeadershipListener};
pub use lease::{LeaseGuard, LeaseManager, LeaseRecord};
pub use store::{CoordinatorStore, StoreConfig};
