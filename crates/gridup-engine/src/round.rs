//! Round orchestration: fan out trials, collect results, pick a winner.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use gridup_core::{NodeTemplate, ResourceList};
use gridup_vcluster::VirtualCluster;

use crate::error::{EngineError, EngineResult};
use crate::scorer::{Scorer, RESOURCE_UNITS_PER_CPU_CORE, RESOURCE_UNITS_PER_MEMORY_GIB};
use crate::state::SimulationState;
use crate::trial::{run_trial, RunResult, TrialContext};

/// Run one round: one trial per (eligible pool × zone), in parallel, each
/// under a fresh runRef. Returns the winning result, or `None` when no
/// trial placed a pod (the loop's no-progress exit).
///
/// Individual trial errors are joined and logged but only fail the round
/// when every trial errored; cancellation always wins.
pub(crate) async fn run_round(
    cluster: &VirtualCluster,
    state: &SimulationState,
    templates: &Arc<BTreeMap<String, NodeTemplate>>,
    scorer: &Arc<dyn Scorer>,
    timeout: Duration,
    cancel: &watch::Receiver<bool>,
    rng: &Arc<Mutex<StdRng>>,
    round: usize,
) -> EngineResult<Option<RunResult>> {
    let capacity = state.total_zones_across_pools().max(1);
    let (tx, mut rx) = mpsc::channel::<EngineResult<RunResult>>(capacity);

    let existing_nodes = Arc::new(state.existing_nodes.clone());
    let scheduled_pods = Arc::new(state.scheduled_pods.clone());
    let unscheduled_pods = Arc::new(state.unscheduled_pods.clone());

    let mut trial_count = 0usize;
    for pool in state.eligible_node_pools.values() {
        for zone in &pool.zones {
            trial_count += 1;
            let ctx = TrialContext {
                cluster: cluster.clone(),
                pool: pool.clone(),
                zone: zone.clone(),
                templates: Arc::clone(templates),
                existing_nodes: Arc::clone(&existing_nodes),
                scheduled_pods: Arc::clone(&scheduled_pods),
                unscheduled_pods: Arc::clone(&unscheduled_pods),
                scorer: Arc::clone(scorer),
                timeout,
                cancel: cancel.clone(),
                rng: Arc::clone(rng),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = run_trial(ctx).await;
                let _ = tx.send(result).await;
            });
        }
    }
    drop(tx);

    let mut winners: Vec<RunResult> = Vec::new();
    let mut errors: Vec<EngineError> = Vec::new();
    while let Some(result) = rx.recv().await {
        match result {
            Ok(run) => {
                if run.has_winner() {
                    winners.push(run);
                }
            }
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        if errors.iter().any(EngineError::is_cancelled) {
            return Err(EngineError::Cancelled);
        }
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        if errors.len() == trial_count {
            return Err(EngineError::Trials(joined));
        }
        warn!(round, errors = %joined, "some simulation trials failed, continuing with survivors");
    }

    for r in &winners {
        info!(
            round,
            pool = %r.node_pool_name,
            zone = %r.zone,
            instance_type = %r.instance_type,
            score = r.node_score,
            "trial result"
        );
    }
    let winner = {
        let mut rng = rng.lock().expect("tie-break rng lock poisoned");
        pick_winner(winners, &mut rng)
    };
    match &winner {
        Some(w) => info!(
            round,
            pool = %w.node_pool_name,
            zone = %w.zone,
            instance_type = %w.instance_type,
            score = w.node_score,
            "winning trial selected"
        ),
        None => info!(round, "no trial placed any pod"),
    }
    Ok(winner)
}

/// Minimise over scores; break exact ties by preferring the larger node,
/// then uniformly at random (seedable via the engine config).
fn pick_winner(results: Vec<RunResult>, rng: &mut StdRng) -> Option<RunResult> {
    if results.is_empty() {
        return None;
    }

    let min_score = results
        .iter()
        .map(|r| r.node_score)
        .fold(f64::INFINITY, f64::min);
    let mut tied: Vec<RunResult> = results
        .into_iter()
        .filter(|r| r.node_score == min_score)
        .collect();
    if tied.len() == 1 {
        return tied.pop();
    }

    let max_units = tied
        .iter()
        .map(|r| capacity_resource_units(&r.node_capacity))
        .fold(f64::NEG_INFINITY, f64::max);
    let mut largest: Vec<RunResult> = tied
        .into_iter()
        .filter(|r| capacity_resource_units(&r.node_capacity) == max_units)
        .collect();
    if largest.len() == 1 {
        return largest.pop();
    }

    // The random pick must depend only on the result multiset, never on
    // trial completion order, or a fixed seed would not replay.
    largest.sort_by(|a, b| {
        (&a.node_pool_name, &a.zone).cmp(&(&b.node_pool_name, &b.zone))
    });
    let index = rng.gen_range(0..largest.len());
    Some(largest.swap_remove(index))
}

fn capacity_resource_units(capacity: &ResourceList) -> f64 {
    capacity.cpu.as_f64() * RESOURCE_UNITS_PER_CPU_CORE
        + capacity.memory.gib() * RESOURCE_UNITS_PER_MEMORY_GIB
}
