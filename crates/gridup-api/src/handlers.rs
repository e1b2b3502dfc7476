//! The recommend handler.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{error, info};

use gridup_core::{Recommendation, RecommendationResponse, SimulationRequest};
use gridup_engine::{build_scorer, Recommender, Scorer};

use crate::ApiState;

fn error_response(status: StatusCode, message: String) -> axum::response::Response {
    (
        status,
        Json(RecommendationResponse {
            recommendation: Recommendation::default(),
            unscheduled_pods: Vec::new(),
            run_time: String::new(),
            error: Some(message),
        }),
    )
        .into_response()
}

/// POST /recommend/ — run the scale-up recommendation engine against the
/// posted cluster snapshot.
pub async fn recommend(State(state): State<ApiState>, body: String) -> axum::response::Response {
    // One request at a time over the shared virtual cluster.
    let _guard = state.gate().clone().lock_owned().await;

    if let Err(e) = state.cluster.factory_reset().await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let mut request: SimulationRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    crate::snapshot::revise_node_templates(&mut request.node_templates, &state.revision);

    info!(
        id = %request.id,
        pools = request.node_pools.len(),
        pods = request.pods.len(),
        strategy = %state.strategy,
        "simulation request received"
    );

    let scorer: Arc<dyn Scorer> = Arc::from(build_scorer(
        state.strategy,
        &state.catalog,
        &request.node_pools,
    ));
    let recommender = Recommender::new(
        state.cluster.clone(),
        scorer,
        state.engine_config.clone(),
    );

    let started = Instant::now();
    match recommender.run(&request, state.cancel.clone()).await {
        Ok(outcome) => {
            let response = RecommendationResponse {
                recommendation: outcome.recommendation,
                unscheduled_pods: outcome.unscheduled_pods,
                run_time: format!("{} millis", started.elapsed().as_millis()),
                error: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!(id = %request.id, error = %e, "recommendation run failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
