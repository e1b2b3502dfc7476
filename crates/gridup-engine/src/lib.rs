//! gridup-engine — the scale-up recommendation engine.
//!
//! Drives rounds of concurrent per-pool/per-zone simulation trials against
//! the embedded virtual cluster, scores each trial's placement, commits
//! one winning node per round, and accumulates the resulting scale-up
//! recommendations until every pending pod is placed or no further
//! progress is possible.

mod error;
mod names;
mod recommender;
mod round;
mod scorer;
mod state;
mod trial;

pub use error::{EngineError, EngineResult};
pub use names::{to_original_resource_name, RunRef};
pub use recommender::{EngineConfig, NodeUtilisation, Recommender, RecommenderOutcome};
pub use scorer::{build_scorer, NodeScore, Scorer, ScoringStrategy};
pub use state::SimulationState;
pub use trial::{PodPlacement, RunResult};
