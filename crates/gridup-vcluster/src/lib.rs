//! gridup-vcluster — an embedded, in-memory control plane.
//!
//! Hosts the virtual cluster the recommendation engine runs its trials
//! against: an object store for nodes, pods, and priority classes, a
//! scheduling-event log, and a background bin-packing scheduler task that
//! binds pending pods the way a real scheduler would — asynchronously,
//! observable only through events.
//!
//! The engine never reaches into the store; everything goes through the
//! operation surface on [`VirtualCluster`].

mod cluster;
mod error;
mod events;
mod scheduler;
mod store;

pub use cluster::VirtualCluster;
pub use error::{ClusterError, ClusterResult};
pub use events::{Event, EventReason, SchedulingOutcome, WaitError};
