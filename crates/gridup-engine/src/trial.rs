//! One simulation trial: probe a single (pool, zone) node addition.
//!
//! Trials run concurrently in a shared virtual cluster. Isolation is by
//! identity, not locking: every object a trial creates carries its runRef
//! label, every cloned node a runRef `NoSchedule` taint, every cloned pod
//! the matching toleration, and every topology-spread selector is narrowed
//! to the runRef label. Any code that edits tolerations or selectors here
//! must reapply that augmentation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use gridup_core::constants::{
    BIN_PACKING_SCHEDULER_NAME, DEFAULT_NAMESPACE, NOT_READY_TAINT_KEY, TOPOLOGY_HOST_LABEL_KEY,
    TOPOLOGY_ZONE_LABEL_KEY,
};
use gridup_core::{find_node_template, Node, NodePool, NodeTemplate, Pod, ResourceList};
use gridup_vcluster::{VirtualCluster, WaitError};

use crate::error::{EngineError, EngineResult};
use crate::names::{random_token_with, to_original_resource_name, RunRef};
use crate::scorer::Scorer;

/// A pod the trial placed, with its cumulative resource requests.
#[derive(Debug, Clone, PartialEq)]
pub struct PodPlacement {
    pub pod_name: String,
    pub requests: ResourceList,
}

/// Outcome of one trial.
///
/// `node_to_pods` maps simulation node names to the pods bound there; the
/// trial has a winner exactly when it is non-empty. `node_name` is already
/// reduced to its original form.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub node_pool_name: String,
    pub node_name: String,
    pub zone: String,
    pub instance_type: String,
    pub node_score: f64,
    pub node_capacity: ResourceList,
    pub node_to_pods: BTreeMap<String, Vec<PodPlacement>>,
    /// Original names of pods this trial could not place.
    pub unscheduled_pods: Vec<String>,
}

impl RunResult {
    pub fn has_winner(&self) -> bool {
        !self.node_to_pods.is_empty()
    }
}

/// Everything one trial needs, cloned or shared from the round.
pub(crate) struct TrialContext {
    pub cluster: VirtualCluster,
    pub pool: NodePool,
    pub zone: String,
    pub templates: Arc<BTreeMap<String, NodeTemplate>>,
    pub existing_nodes: Arc<Vec<Node>>,
    pub scheduled_pods: Arc<Vec<Pod>>,
    pub unscheduled_pods: Arc<Vec<Pod>>,
    pub scorer: Arc<dyn Scorer>,
    pub timeout: Duration,
    pub cancel: watch::Receiver<bool>,
    /// Shared seeded RNG: run-ref tokens and node-name prefixes must
    /// replay under a fixed seed.
    pub rng: Arc<Mutex<StdRng>>,
}

pub(crate) async fn run_trial(ctx: TrialContext) -> EngineResult<RunResult> {
    let (run_ref, node_base_token) = {
        let mut rng = ctx.rng.lock().expect("trial rng lock poisoned");
        (
            RunRef::with_rng(&mut *rng),
            random_token_with(&mut *rng, 4),
        )
    };
    debug!(
        pool = %ctx.pool.name,
        zone = %ctx.zone,
        run_ref = %run_ref.value,
        "simulation trial started"
    );
    let result = execute_trial(&ctx, &run_ref, &node_base_token).await;
    cleanup_trial(&ctx.cluster, &run_ref).await;
    result
}

async fn execute_trial(
    ctx: &TrialContext,
    run_ref: &RunRef,
    node_base_token: &str,
) -> EngineResult<RunResult> {
    let template = find_node_template(&ctx.templates, &ctx.pool.name, &ctx.zone).ok_or_else(
        || EngineError::TemplateMissing {
            pool: ctx.pool.name.clone(),
            zone: ctx.zone.clone(),
        },
    )?;

    clone_cluster_baseline(ctx, run_ref).await?;

    let sim_node = construct_sim_node(template, &ctx.pool.name, &ctx.zone, run_ref, node_base_token);
    ctx.cluster
        .create_and_untaint_nodes(NOT_READY_TAINT_KEY, std::slice::from_ref(&sim_node))
        .await?;

    let deploy_time = Instant::now();
    let clones = clone_unscheduled_pods(&ctx.unscheduled_pods, run_ref);
    let clone_names: Vec<String> = clones.iter().map(|p| p.name.clone()).collect();
    ctx.cluster.create_pods(&clones).await?;

    let outcome = match ctx
        .cluster
        .wait_for_pod_scheduling(&clone_names, deploy_time, ctx.timeout, ctx.cancel.clone())
        .await
    {
        Ok(outcome) => outcome,
        // Pods still unconfirmed at the deadline count as unscheduled for
        // this trial only.
        Err(WaitError::Timeout(partial)) => {
            warn!(
                pool = %ctx.pool.name,
                zone = %ctx.zone,
                scheduled = partial.scheduled.len(),
                "timed out waiting for scheduling events"
            );
            partial
        }
        Err(WaitError::Cancelled) => return Err(EngineError::Cancelled),
    };

    let scheduled_names: Vec<String> = outcome.scheduled.iter().cloned().collect();
    let updated = ctx
        .cluster
        .get_pods_matching_names(DEFAULT_NAMESPACE, &scheduled_names)
        .await;
    let candidate_pods = merge_updated_pods(&clones, &updated);

    let score = ctx.scorer.compute(&sim_node, &candidate_pods);
    debug!(
        pool = %ctx.pool.name,
        zone = %ctx.zone,
        score = score.cumulative,
        scheduled = outcome.scheduled.len(),
        unscheduled = outcome.unscheduled.len(),
        "simulation trial scored"
    );

    Ok(build_run_result(
        ctx,
        &sim_node,
        score.cumulative,
        candidate_pods,
    ))
}

/// Clone every existing node and already-scheduled pod under the trial's
/// runRef so the scheduler sees this trial's private copy of the cluster.
async fn clone_cluster_baseline(ctx: &TrialContext, run_ref: &RunRef) -> EngineResult<()> {
    let cloned_nodes: Vec<Node> = ctx
        .existing_nodes
        .iter()
        .map(|node| {
            let mut clone = node.clone();
            clone.name = run_ref.resource_name(&node.name);
            clone
                .labels
                .insert(run_ref.key.to_string(), run_ref.value.clone());
            clone
                .labels
                .insert(TOPOLOGY_HOST_LABEL_KEY.to_string(), clone.name.clone());
            clone.taints.push(run_ref.taint());
            clone
        })
        .collect();
    if !cloned_nodes.is_empty() {
        ctx.cluster
            .create_and_untaint_nodes(NOT_READY_TAINT_KEY, &cloned_nodes)
            .await?;
    }

    let cloned_pods: Vec<Pod> = ctx
        .scheduled_pods
        .iter()
        .map(|pod| {
            let mut clone = pod.clone();
            clone.name = run_ref.resource_name(&pod.name);
            clone
                .labels
                .insert(run_ref.key.to_string(), run_ref.value.clone());
            clone.spec.tolerations.push(run_ref.toleration());
            augment_spread_selectors(&mut clone, run_ref);
            if !clone.spec.node_name.is_empty() {
                clone.spec.node_name = run_ref.resource_name(&pod.spec.node_name);
            }
            clone
        })
        .collect();
    if !cloned_pods.is_empty() {
        ctx.cluster.create_pods(&cloned_pods).await?;
    }
    Ok(())
}

/// Build the trial's synthetic node from the (pool, zone) template. The
/// runRef taint stays on after the not-ready untaint: it is the isolation
/// mechanism, tolerated only by this trial's pods.
fn construct_sim_node(
    template: &NodeTemplate,
    pool_name: &str,
    zone: &str,
    run_ref: &RunRef,
    base_token: &str,
) -> Node {
    let base = format!("{base_token}-{pool_name}");
    let name = run_ref.resource_name(&base);
    let mut labels = template.labels.clone();
    labels.insert(TOPOLOGY_ZONE_LABEL_KEY.to_string(), zone.to_string());
    labels.insert(run_ref.key.to_string(), run_ref.value.clone());
    labels.insert(TOPOLOGY_HOST_LABEL_KEY.to_string(), name.clone());

    let mut taints = vec![run_ref.taint()];
    taints.extend(template.taints.iter().cloned());

    Node {
        name,
        labels,
        taints,
        allocatable: template.allocatable,
        capacity: template.capacity,
    }
}

/// Clone the currently-unscheduled pods for this trial: renamed, labelled,
/// tolerating only this trial's taint, spread-selectors narrowed, and
/// addressed to the bin-packing scheduler.
fn clone_unscheduled_pods(pods: &[Pod], run_ref: &RunRef) -> Vec<Pod> {
    pods.iter()
        .map(|pod| {
            let mut clone = pod.clone();
            clone.name = run_ref.resource_name(&pod.name);
            clone
                .labels
                .insert(run_ref.key.to_string(), run_ref.value.clone());
            clone.spec.tolerations = vec![run_ref.toleration()];
            augment_spread_selectors(&mut clone, run_ref);
            clone.spec.scheduler_name = BIN_PACKING_SCHEDULER_NAME.to_string();
            clone
        })
        .collect()
}

/// Narrow every topology-spread selector to this trial's pods so spread
/// is computed only among the trial's own clones.
fn augment_spread_selectors(pod: &mut Pod, run_ref: &RunRef) {
    for constraint in &mut pod.spec.topology_spread_constraints {
        constraint
            .label_selector
            .match_labels
            .insert(run_ref.key.to_string(), run_ref.value.clone());
    }
}

/// Merge freshly-fetched pod state into the submitted clone list: a clone
/// absent from `updated` keeps its original (unbound) state.
fn merge_updated_pods(clones: &[Pod], updated: &[Pod]) -> Vec<Pod> {
    clones
        .iter()
        .map(|clone| {
            updated
                .iter()
                .find(|u| u.name == clone.name)
                .cloned()
                .unwrap_or_else(|| clone.clone())
        })
        .collect()
}

fn build_run_result(
    ctx: &TrialContext,
    sim_node: &Node,
    score: f64,
    candidate_pods: Vec<Pod>,
) -> RunResult {
    // A zero score means the trial produced nothing useful; it must not
    // present itself as a winner.
    if score == 0.0 {
        return RunResult {
            node_pool_name: ctx.pool.name.clone(),
            node_name: to_original_resource_name(&sim_node.name),
            zone: ctx.zone.clone(),
            instance_type: ctx.pool.instance_type.clone(),
            node_score: score,
            node_capacity: sim_node.capacity,
            node_to_pods: BTreeMap::new(),
            unscheduled_pods: candidate_pods
                .iter()
                .map(|p| to_original_resource_name(&p.name))
                .collect(),
        };
    }

    let mut node_to_pods: BTreeMap<String, Vec<PodPlacement>> = BTreeMap::new();
    let mut unscheduled = Vec::new();
    for pod in &candidate_pods {
        if pod.is_bound() {
            node_to_pods
                .entry(pod.spec.node_name.clone())
                .or_default()
                .push(PodPlacement {
                    pod_name: pod.name.clone(),
                    requests: pod.total_requests(),
                });
        } else {
            unscheduled.push(to_original_resource_name(&pod.name));
        }
    }

    RunResult {
        node_pool_name: ctx.pool.name.clone(),
        node_name: to_original_resource_name(&sim_node.name),
        zone: ctx.zone.clone(),
        instance_type: ctx.pool.instance_type.clone(),
        node_score: score,
        node_capacity: sim_node.capacity,
        node_to_pods,
        unscheduled_pods: unscheduled,
    }
}

/// Best-effort removal of everything this trial created, keyed by its
/// runRef label. Failures are logged; stragglers are swept by the next
/// request's factory reset.
async fn cleanup_trial(cluster: &VirtualCluster, run_ref: &RunRef) {
    let labels = run_ref.as_label_map();
    if let Err(e) = cluster.delete_pods_matching_labels(&labels).await {
        error!(run_ref = %run_ref.value, error = %e, "failed to delete trial pods");
    }
    if let Err(e) = cluster.delete_nodes_matching_labels(&labels).await {
        error!(run_ref = %run_ref.value, error = %e, "failed to delete trial nodes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridup_core::{LabelSelector, PodSpec, TopologySpreadConstraint, UnsatisfiableAction};

    fn template() -> NodeTemplate {
        let mut labels = BTreeMap::new();
        labels.insert(
            gridup_core::constants::WORKER_POOL_LABEL_KEY.to_string(),
            "p1".to_string(),
        );
        labels.insert(
            gridup_core::constants::INSTANCE_TYPE_LABEL_KEY.to_string(),
            "m5.large".to_string(),
        );
        NodeTemplate {
            instance_type: "m5.large".to_string(),
            labels,
            taints: vec![],
            allocatable: ResourceList {
                cpu: "2".parse().unwrap(),
                memory: "8Gi".parse().unwrap(),
                pods: gridup_core::Quantity::from_units(110),
            },
            capacity: ResourceList {
                cpu: "2".parse().unwrap(),
                memory: "8Gi".parse().unwrap(),
                pods: gridup_core::Quantity::from_units(110),
            },
            zone: "a".to_string(),
            region: "r".to_string(),
        }
    }

    #[test]
    fn sim_node_carries_run_ref_identity() {
        let run_ref = RunRef::new();
        let node = construct_sim_node(&template(), "p1", "a", &run_ref, "x7kq");

        assert!(node.name.contains("-p1-sr-"));
        assert_eq!(node.labels.get(run_ref.key), Some(&run_ref.value));
        assert_eq!(
            node.labels.get(TOPOLOGY_ZONE_LABEL_KEY),
            Some(&"a".to_string())
        );
        assert_eq!(node.labels.get(TOPOLOGY_HOST_LABEL_KEY), Some(&node.name));
        assert!(node
            .taints
            .iter()
            .any(|t| t.key == run_ref.key && t.value == run_ref.value));
        assert!(!to_original_resource_name(&node.name).contains("-sr-"));
    }

    #[test]
    fn unscheduled_clones_tolerate_only_their_own_run() {
        let run_ref = RunRef::new();
        let pod = Pod {
            name: "web-0".to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            owner_references: vec![],
            spec: PodSpec {
                tolerations: vec![gridup_core::Toleration::equal("stale", "toleration")],
                topology_spread_constraints: vec![TopologySpreadConstraint {
                    max_skew: 1,
                    topology_key: TOPOLOGY_ZONE_LABEL_KEY.to_string(),
                    when_unsatisfiable: UnsatisfiableAction::DoNotSchedule,
                    label_selector: LabelSelector::default(),
                    min_domains: None,
                }],
                ..PodSpec::default()
            },
            nominated_node_name: String::new(),
        };

        let clones = clone_unscheduled_pods(&[pod], &run_ref);
        let clone = &clones[0];

        assert_eq!(clone.name, run_ref.resource_name("web-0"));
        assert_eq!(clone.spec.scheduler_name, BIN_PACKING_SCHEDULER_NAME);
        // The stale toleration is replaced, not appended to.
        assert_eq!(clone.spec.tolerations.len(), 1);
        assert!(clone.spec.tolerations[0].tolerates(&run_ref.taint()));
        assert_eq!(
            clone.spec.topology_spread_constraints[0]
                .label_selector
                .match_labels
                .get(run_ref.key),
            Some(&run_ref.value)
        );
    }

    #[test]
    fn merge_prefers_updated_state() {
        let run_ref = RunRef::new();
        let clone = Pod {
            name: run_ref.resource_name("web-0"),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            owner_references: vec![],
            spec: PodSpec::default(),
            nominated_node_name: String::new(),
        };
        let mut bound = clone.clone();
        bound.spec.node_name = "some-node".to_string();

        let merged = merge_updated_pods(&[clone.clone()], &[bound]);
        assert_eq!(merged[0].spec.node_name, "some-node");

        // Absent from the update → stays unbound.
        let merged = merge_updated_pods(&[clone], &[]);
        assert_eq!(merged[0].spec.node_name, "");
    }
}
