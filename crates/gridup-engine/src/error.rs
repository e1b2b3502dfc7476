//! Engine error types.
//!
//! Trial errors are recoverable — a round proceeds on its surviving
//! trials. Init and commit errors are fatal to the request.

use thiserror::Error;

use gridup_vcluster::ClusterError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to initialize virtual cluster: {0}")]
    Init(String),

    #[error("no node template found for pool {pool} in zone {zone}")]
    TemplateMissing { pool: String, zone: String },

    #[error("virtual cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("simulation cancelled")]
    Cancelled,

    #[error("all simulation trials failed: {0}")]
    Trials(String),

    #[error("failed to commit winning result: {0}")]
    Commit(String),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
