//! The recommendation loop: drive rounds, commit winners, emit results.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::{debug, info};

use gridup_core::constants::NOT_READY_TAINT_KEY;
use gridup_core::{
    Pod, PodKey, Recommendation, ResourceList, ScaleUpRecommendation, SimulationRequest,
};
use gridup_vcluster::VirtualCluster;

use crate::error::{EngineError, EngineResult};
use crate::names::to_original_resource_name;
use crate::round::run_round;
use crate::scorer::Scorer;
use crate::state::SimulationState;
use crate::trial::RunResult;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-trial deadline for scheduling-event confirmation.
    pub trial_timeout: Duration,
    /// Seed for the tie-break RNG; random when unset.
    pub tie_break_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            trial_timeout: Duration::from_secs(10),
            tie_break_seed: None,
        }
    }
}

/// How one committed node ended up utilised. Observability only.
#[derive(Debug, Clone)]
pub struct NodeUtilisation {
    pub node_name: String,
    pub node_pool_name: String,
    pub zone: String,
    pub pods: Vec<String>,
    pub resources_consumed: ResourceList,
    pub capacity: ResourceList,
}

/// Final engine output for one request.
#[derive(Debug, Clone, Default)]
pub struct RecommenderOutcome {
    pub recommendation: Recommendation,
    pub unscheduled_pods: Vec<PodKey>,
    pub node_utilisations: Vec<NodeUtilisation>,
}

/// Scale-up recommender. One instance serves one request at a time; all
/// of its state is request-scoped.
pub struct Recommender {
    cluster: VirtualCluster,
    scorer: Arc<dyn Scorer>,
    config: EngineConfig,
}

impl Recommender {
    pub fn new(cluster: VirtualCluster, scorer: Arc<dyn Scorer>, config: EngineConfig) -> Self {
        Recommender {
            cluster,
            scorer,
            config,
        }
    }

    /// Run the recommendation loop for one request.
    ///
    /// Each round fans out trials, commits the single winning node, and
    /// moves its pods from unscheduled to scheduled. The loop ends when no
    /// unscheduled pods remain, no trial makes progress, or an error fires.
    pub async fn run(
        &self,
        req: &SimulationRequest,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<RecommenderOutcome> {
        let mut state = SimulationState::from_request(req);
        self.initialize_virtual_cluster(&state).await?;

        let templates = Arc::new(req.node_templates.clone());
        let rng = Arc::new(Mutex::new(match self.config.tie_break_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }));

        let mut recommendations: Vec<ScaleUpRecommendation> = Vec::new();
        let mut node_utilisations: Vec<NodeUtilisation> = Vec::new();
        let mut round = 0usize;

        loop {
            round += 1;
            if state.unscheduled_pods.is_empty() {
                info!(round, "all pods scheduled, recommendation loop done");
                break;
            }
            if state.eligible_node_pools.is_empty() {
                info!(round, "no node pool has headroom left, exiting early");
                break;
            }

            info!(round, unscheduled = state.unscheduled_pods.len(), "round started");
            let winner = run_round(
                &self.cluster,
                &state,
                &templates,
                &self.scorer,
                self.config.trial_timeout,
                &cancel,
                &rng,
                round,
            )
            .await?;

            let Some(winner) = winner else {
                info!(round, "no winner, exiting early with current recommendations");
                break;
            };

            let rec = to_scale_up_recommendation(&winner);
            self.commit_winner(&mut state, &templates, &rec, &winner)
                .await?;
            node_utilisations.push(node_utilisation(&winner));
            append_scale_up(&mut recommendations, rec);
        }

        Ok(RecommenderOutcome {
            recommendation: Recommendation {
                scale_up: recommendations,
                scale_down: Vec::new(),
            },
            unscheduled_pods: state.unscheduled_pod_keys(),
            node_utilisations,
        })
    }

    /// Seed the virtual cluster with the request's existing nodes,
    /// priority classes, and already-scheduled pods.
    async fn initialize_virtual_cluster(&self, state: &SimulationState) -> EngineResult<()> {
        if !state.existing_nodes.is_empty() {
            self.cluster
                .create_and_untaint_nodes(NOT_READY_TAINT_KEY, &state.existing_nodes)
                .await
                .map_err(|e| EngineError::Init(e.to_string()))?;
        }
        self.cluster
            .create_priority_classes(&state.priority_classes)
            .await
            .map_err(|e| EngineError::Init(e.to_string()))?;
        if !state.scheduled_pods.is_empty() {
            self.cluster
                .create_pods(&state.scheduled_pods)
                .await
                .map_err(|e| EngineError::Init(e.to_string()))?;
        }
        debug!(
            nodes = state.existing_nodes.len(),
            scheduled_pods = state.scheduled_pods.len(),
            priority_classes = state.priority_classes.len(),
            "virtual cluster initialized"
        );
        Ok(())
    }

    /// Materialise the winner in the virtual cluster and sync the
    /// simulation state. Failures here are fatal to the request.
    async fn commit_winner(
        &self,
        state: &mut SimulationState,
        templates: &BTreeMap<String, gridup_core::NodeTemplate>,
        rec: &ScaleUpRecommendation,
        winner: &RunResult,
    ) -> EngineResult<()> {
        // Pin each placed pod's original onto the de-synthesised node name.
        let mut pinned_pods: Vec<Pod> = Vec::new();
        for (sim_node_name, placements) in &winner.node_to_pods {
            let target_node = to_original_resource_name(sim_node_name);
            for placement in placements {
                let original_name = to_original_resource_name(&placement.pod_name);
                let original = state
                    .original_unscheduled_pods
                    .get(&original_name)
                    .ok_or_else(|| {
                        EngineError::Commit(format!(
                            "pod {original_name} not found in the original pods collection"
                        ))
                    })?;
                let mut pinned = original.clone();
                pinned.spec.node_name = target_node.clone();
                pinned_pods.push(pinned);
            }
        }
        self.cluster
            .create_pods(&pinned_pods)
            .await
            .map_err(|e| EngineError::Commit(e.to_string()))?;

        // Materialise the winner's canonical node.
        let canonical = winner_canonical_node(templates, winner)?;
        self.cluster
            .create_and_untaint_nodes(NOT_READY_TAINT_KEY, std::slice::from_ref(&canonical))
            .await
            .map_err(|e| EngineError::Commit(e.to_string()))?;

        // Sync recommender state.
        let committed_node = self
            .cluster
            .get_node(&winner.node_name)
            .await
            .ok_or_else(|| {
                EngineError::Commit(format!("committed node {} not found", winner.node_name))
            })?;
        state.existing_nodes.push(committed_node);
        let scheduled_names: Vec<String> = pinned_pods.iter().map(|p| p.name.clone()).collect();
        state
            .unscheduled_pods
            .retain(|p| !scheduled_names.contains(&p.name));
        state.scheduled_pods.extend(pinned_pods);
        state.update_eligible_pools(rec);

        info!(
            pool = %rec.node_pool_name,
            zone = %rec.zone,
            node = %winner.node_name,
            pods = scheduled_names.len(),
            "winning result committed"
        );
        Ok(())
    }
}

/// Build the winner's canonical (non-synthetic) node from its template,
/// keeping the name the trial already de-synthesised.
fn winner_canonical_node(
    templates: &BTreeMap<String, gridup_core::NodeTemplate>,
    winner: &RunResult,
) -> EngineResult<gridup_core::Node> {
    use gridup_core::constants::{TOPOLOGY_HOST_LABEL_KEY, TOPOLOGY_ZONE_LABEL_KEY};

    let template = gridup_core::find_node_template(templates, &winner.node_pool_name, &winner.zone)
        .ok_or_else(|| {
            EngineError::Commit(format!(
                "no node template found for pool {} in zone {}",
                winner.node_pool_name, winner.zone
            ))
        })?;

    let mut labels = template.labels.clone();
    labels.insert(TOPOLOGY_ZONE_LABEL_KEY.to_string(), winner.zone.clone());
    labels.insert(TOPOLOGY_HOST_LABEL_KEY.to_string(), winner.node_name.clone());

    Ok(gridup_core::Node {
        name: winner.node_name.clone(),
        labels,
        taints: template.taints.clone(),
        allocatable: template.allocatable,
        capacity: template.capacity,
    })
}

fn to_scale_up_recommendation(winner: &RunResult) -> ScaleUpRecommendation {
    ScaleUpRecommendation {
        zone: winner.zone.clone(),
        node_pool_name: winner.node_pool_name.clone(),
        increment_by: 1,
        instance_type: winner.instance_type.clone(),
        node_names: vec![winner.node_name.clone()],
    }
}

/// Coalesce: merge recommendations sharing (pool, zone) by summing
/// increments and concatenating node names.
fn append_scale_up(
    recommendations: &mut Vec<ScaleUpRecommendation>,
    rec: ScaleUpRecommendation,
) {
    if let Some(existing) = recommendations
        .iter_mut()
        .find(|r| r.node_pool_name == rec.node_pool_name && r.zone == rec.zone)
    {
        existing.increment_by += rec.increment_by;
        existing.node_names.extend(rec.node_names);
    } else {
        recommendations.push(rec);
    }
}

fn node_utilisation(winner: &RunResult) -> NodeUtilisation {
    let mut pods = Vec::new();
    let mut consumed = ResourceList::ZERO;
    for placements in winner.node_to_pods.values() {
        for placement in placements {
            pods.push(to_original_resource_name(&placement.pod_name));
            consumed += placement.requests;
        }
    }
    NodeUtilisation {
        node_name: winner.node_name.clone(),
        node_pool_name: winner.node_pool_name.clone(),
        zone: winner.zone.clone(),
        pods,
        resources_consumed: consumed,
        capacity: winner.node_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{build_scorer, ScoringStrategy};
    use gridup_core::constants::{INSTANCE_TYPE_LABEL_KEY, WORKER_POOL_LABEL_KEY};
    use gridup_core::{
        Container, NodePool, NodeTemplate, PodInfo, PodSpec, Quantity,
    };
    use gridup_pricing::PricingCatalog;
    use std::collections::BTreeSet;

    fn pool(name: &str, instance_type: &str, zones: &[&str], max: u32, current: u32) -> NodePool {
        NodePool {
            name: name.to_string(),
            zones: zones.iter().map(|z| z.to_string()).collect::<BTreeSet<_>>(),
            max,
            current,
            instance_type: instance_type.to_string(),
        }
    }

    fn template(pool: &str, instance_type: &str, zone: &str, cpu: &str, memory: &str) -> NodeTemplate {
        let mut labels = BTreeMap::new();
        labels.insert(WORKER_POOL_LABEL_KEY.to_string(), pool.to_string());
        labels.insert(INSTANCE_TYPE_LABEL_KEY.to_string(), instance_type.to_string());
        let resources = ResourceList {
            cpu: cpu.parse().unwrap(),
            memory: memory.parse().unwrap(),
            pods: Quantity::from_units(110),
        };
        NodeTemplate {
            instance_type: instance_type.to_string(),
            labels,
            taints: vec![],
            allocatable: resources,
            capacity: resources,
            zone: zone.to_string(),
            region: "eu-west-1".to_string(),
        }
    }

    fn pod_info(name: &str, cpu: &str, memory: &str, count: u32) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            labels: BTreeMap::new(),
            owner_references: vec![],
            spec: PodSpec {
                containers: vec![Container {
                    name: "c".to_string(),
                    requests: ResourceList::new(cpu.parse().unwrap(), memory.parse().unwrap()),
                }],
                ..PodSpec::default()
            },
            nominated_node_name: String::new(),
            count,
        }
    }

    fn recommender(cluster: &VirtualCluster, pools: &[NodePool], seed: u64) -> Recommender {
        let catalog = PricingCatalog::builtin("aws").unwrap();
        let scorer: Arc<dyn Scorer> =
            Arc::from(build_scorer(ScoringStrategy::CostOnly, &catalog, pools));
        Recommender::new(
            cluster.clone(),
            scorer,
            EngineConfig {
                trial_timeout: Duration::from_secs(10),
                tie_break_seed: Some(seed),
            },
        )
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn empty_input_yields_empty_recommendation() {
        let cluster = VirtualCluster::start();
        let pools = vec![pool("p1", "m5.large", &["a"], 3, 0)];
        let mut templates = BTreeMap::new();
        templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
        let req = SimulationRequest {
            id: "empty".to_string(),
            node_pools: pools.clone(),
            priority_classes: vec![],
            pods: vec![],
            nodes: vec![],
            node_templates: templates,
            pod_order: None,
        };

        let outcome = recommender(&cluster, &pools, 1)
            .run(&req, no_cancel())
            .await
            .unwrap();
        assert!(outcome.recommendation.scale_up.is_empty());
        assert!(outcome.unscheduled_pods.is_empty());
        cluster.stop().await;
    }

    #[tokio::test]
    async fn capacity_cap_limits_increments_and_reports_residue() {
        // One pool capped at 2 nodes; each node fits one 5Gi pod out of 8Gi.
        let cluster = VirtualCluster::start();
        let pools = vec![pool("p1", "m5.large", &["a"], 2, 0)];
        let mut templates = BTreeMap::new();
        templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
        let req = SimulationRequest {
            id: "capped".to_string(),
            node_pools: pools.clone(),
            priority_classes: vec![],
            pods: vec![pod_info("web", "100m", "5Gi", 20)],
            nodes: vec![],
            node_templates: templates,
            pod_order: None,
        };

        let outcome = recommender(&cluster, &pools, 1)
            .run(&req, no_cancel())
            .await
            .unwrap();

        let scale_up = &outcome.recommendation.scale_up;
        assert_eq!(scale_up.len(), 1, "entries coalesce per (pool, zone)");
        assert_eq!(scale_up[0].node_pool_name, "p1");
        assert_eq!(scale_up[0].zone, "a");
        assert_eq!(scale_up[0].increment_by, 2);
        assert_eq!(scale_up[0].node_names.len(), 2);
        assert_eq!(outcome.unscheduled_pods.len(), 18);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn saturated_pools_produce_no_recommendation() {
        let cluster = VirtualCluster::start();
        let pools = vec![pool("p1", "m5.large", &["a"], 2, 2)];
        let mut templates = BTreeMap::new();
        templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
        let req = SimulationRequest {
            id: "saturated".to_string(),
            node_pools: pools.clone(),
            priority_classes: vec![],
            pods: vec![pod_info("web", "100m", "5Gi", 4)],
            nodes: vec![],
            node_templates: templates,
            pod_order: None,
        };

        let outcome = recommender(&cluster, &pools, 1)
            .run(&req, no_cancel())
            .await
            .unwrap();
        assert!(outcome.recommendation.scale_up.is_empty());
        assert_eq!(outcome.unscheduled_pods.len(), 4);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn identical_pools_tie_break_is_deterministic_under_seed() {
        let make_request = || {
            let pools = vec![
                pool("p1", "m5.large", &["a"], 3, 0),
                pool("p2", "m5.large", &["a"], 3, 0),
                pool("p3", "m5.large", &["a"], 3, 0),
            ];
            let mut templates = BTreeMap::new();
            templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
            templates.insert("t2".to_string(), template("p2", "m5.large", "a", "2", "8Gi"));
            templates.insert("t3".to_string(), template("p3", "m5.large", "a", "2", "8Gi"));
            (
                pools.clone(),
                SimulationRequest {
                    id: "tie".to_string(),
                    node_pools: pools,
                    priority_classes: vec![],
                    pods: vec![pod_info("web", "100m", "2Gi", 3)],
                    nodes: vec![],
                    node_templates: templates,
                    pod_order: None,
                },
            )
        };

        let mut picks = Vec::new();
        for _ in 0..2 {
            let cluster = VirtualCluster::start();
            let (pools, req) = make_request();
            let outcome = recommender(&cluster, &pools, 42)
                .run(&req, no_cancel())
                .await
                .unwrap();
            assert_eq!(outcome.recommendation.scale_up.len(), 1);
            picks.push(outcome.recommendation.scale_up[0].node_pool_name.clone());
            cluster.stop().await;
        }
        assert_eq!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn replay_with_fixed_seed_is_byte_identical() {
        // Single eligible pool with one zone: all randomness (run refs,
        // node-name prefixes, tie-breaks) flows from the seed, so two runs
        // must serialise identically, node names included.
        let make_request = || {
            let pools = vec![pool("p1", "m5.large", &["a"], 2, 0)];
            let mut templates = BTreeMap::new();
            templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
            (
                pools.clone(),
                SimulationRequest {
                    id: "replay".to_string(),
                    node_pools: pools,
                    priority_classes: vec![],
                    pods: vec![pod_info("web", "100m", "5Gi", 2)],
                    nodes: vec![],
                    node_templates: templates,
                    pod_order: None,
                },
            )
        };

        let mut serialised = Vec::new();
        for _ in 0..2 {
            let cluster = VirtualCluster::start();
            let (pools, req) = make_request();
            let outcome = recommender(&cluster, &pools, 9)
                .run(&req, no_cancel())
                .await
                .unwrap();
            serialised.push(serde_json::to_string(&outcome.recommendation).unwrap());
            cluster.stop().await;
        }
        assert_eq!(serialised[0], serialised[1]);
    }

    #[tokio::test]
    async fn cancellation_surfaces_promptly() {
        let cluster = VirtualCluster::start();
        let pools = vec![pool("p1", "m5.large", &["a"], 3, 0)];
        let mut templates = BTreeMap::new();
        templates.insert("t1".to_string(), template("p1", "m5.large", "a", "2", "8Gi"));
        let req = SimulationRequest {
            id: "cancelled".to_string(),
            node_pools: pools.clone(),
            priority_classes: vec![],
            pods: vec![pod_info("web", "100m", "5Gi", 8)],
            nodes: vec![],
            node_templates: templates,
            pod_order: None,
        };

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = recommender(&cluster, &pools, 1)
            .run(&req, rx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // Trial cleanup ran: nothing carrying a simulation-run label stays.
        let leftovers = cluster
            .list_pods_filtered(|p| {
                p.labels
                    .contains_key(gridup_core::constants::SIM_RUN_LABEL_KEY)
            })
            .await;
        assert!(leftovers.is_empty());
        cluster.stop().await;
    }

    #[tokio::test]
    async fn progress_strictly_reduces_unscheduled_pods() {
        let cluster = VirtualCluster::start();
        let pools = vec![pool("p1", "m5.xlarge", &["a"], 4, 0)];
        let mut templates = BTreeMap::new();
        templates.insert(
            "t1".to_string(),
            template("p1", "m5.xlarge", "a", "4", "16Gi"),
        );
        let req = SimulationRequest {
            id: "progress".to_string(),
            node_pools: pools.clone(),
            priority_classes: vec![],
            pods: vec![pod_info("web", "100m", "5Gi", 6)],
            nodes: vec![],
            node_templates: templates,
            pod_order: None,
        };

        let outcome = recommender(&cluster, &pools, 1)
            .run(&req, no_cancel())
            .await
            .unwrap();

        // 16Gi fits three 5Gi pods per node: 6 pods need 2 nodes.
        assert_eq!(outcome.unscheduled_pods.len(), 0);
        let total: u32 = outcome
            .recommendation
            .scale_up
            .iter()
            .map(|r| r.increment_by)
            .sum();
        assert_eq!(total, 2);
        // Conservation: committed pods all come from the supplied set.
        for util in &outcome.node_utilisations {
            for pod in &util.pods {
                assert!(pod.starts_with("web-"), "unexpected pod {pod}");
            }
        }
        cluster.stop().await;
    }
}
