//! Virtual-cluster error types.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the virtual cluster's operation surface.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("pod already exists: {0}")]
    PodExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}
