//! gridup-api — HTTP surface for the scale-up recommender.
//!
//! One operation: `POST /recommend/` (alias `/simulation/`) takes a JSON
//! cluster snapshot and returns the recommendation envelope. 200 covers
//! normal completion including "some pods remain unscheduled"; 400 is a
//! parse error; 500 an internal failure.

pub mod handlers;
pub mod snapshot;

use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use tokio::sync::{watch, Mutex};

use gridup_engine::{EngineConfig, ScoringStrategy};
use gridup_pricing::PricingCatalog;
use gridup_vcluster::VirtualCluster;

pub use snapshot::TemplateRevisionConfig;

/// Shared state for the recommend handler.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: VirtualCluster,
    pub catalog: Arc<PricingCatalog>,
    pub strategy: ScoringStrategy,
    pub engine_config: EngineConfig,
    pub revision: TemplateRevisionConfig,
    /// Serializes requests over the shared virtual cluster.
    request_gate: Arc<Mutex<()>>,
    /// Daemon shutdown doubles as request cancellation.
    pub cancel: watch::Receiver<bool>,
}

impl ApiState {
    pub fn new(
        cluster: VirtualCluster,
        catalog: Arc<PricingCatalog>,
        strategy: ScoringStrategy,
        engine_config: EngineConfig,
        revision: TemplateRevisionConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        ApiState {
            cluster,
            catalog,
            strategy,
            engine_config,
            revision,
            request_gate: Arc::new(Mutex::new(())),
            cancel,
        }
    }

    pub(crate) fn gate(&self) -> &Arc<Mutex<()>> {
        &self.request_gate
    }
}

/// Build the recommender router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/recommend", post(handlers::recommend))
        .route("/recommend/", post(handlers::recommend))
        .route("/simulation", post(handlers::recommend))
        .route("/simulation/", post(handlers::recommend))
        .with_state(state)
}
