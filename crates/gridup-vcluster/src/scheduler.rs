//! The embedded bin-packing scheduler.
//!
//! A background task that repeatedly scans pending pods addressed to the
//! bin-packing scheduler and binds each to the feasible node that ends up
//! most packed. Outcomes surface only as `Scheduled` / `FailedScheduling`
//! events; callers observe them through the event waiter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tracing::{debug, trace};

use gridup_core::constants::BIN_PACKING_SCHEDULER_NAME;
use gridup_core::{
    Node, Pod, ResourceList, TaintEffect, TopologySpreadConstraint, UnsatisfiableAction,
};

use crate::events::{Event, EventReason};
use crate::store::ClusterData;

pub(crate) const SCHEDULER_TICK: Duration = Duration::from_millis(5);

pub(crate) async fn run(
    data: Arc<RwLock<ClusterData>>,
    mut shutdown: watch::Receiver<bool>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("embedded scheduler stopping");
                    break;
                }
            }
            _ = interval.tick() => {
                schedule_pass(&data).await;
            }
        }
    }
}

/// One scheduling pass: bind as many pending pods as possible, in
/// creation order, under a single write lock so the pass is atomic.
async fn schedule_pass(data: &Arc<RwLock<ClusterData>>) {
    let mut data = data.write().await;

    let mut pending: Vec<(u64, String)> = data
        .pods
        .iter()
        .filter(|(_, p)| !p.is_bound() && p.spec.scheduler_name == BIN_PACKING_SCHEDULER_NAME)
        .map(|(key, _)| (data.pod_seq.get(key).copied().unwrap_or(u64::MAX), key.clone()))
        .collect();
    if pending.is_empty() {
        return;
    }
    pending.sort();

    let mut usage = node_usage(&data.pods);

    for (_, pod_key) in pending {
        let pod = match data.pods.get(&pod_key) {
            Some(p) => p.clone(),
            None => continue,
        };
        match pick_node(&pod, &data.nodes, &data.pods, &usage) {
            Some(node_name) => {
                let requests = pod.total_requests();
                *usage.entry(node_name.clone()).or_default() += requests;
                if let Some(stored) = data.pods.get_mut(&pod_key) {
                    stored.spec.node_name = node_name.clone();
                }
                data.failed_marks.remove(&pod_key);
                trace!(pod = %pod.name, node = %node_name, "pod bound");
                data.events.push(Event {
                    reason: EventReason::Scheduled,
                    pod_name: pod.name.clone(),
                    message: format!("assigned {}/{} to {node_name}", pod.namespace, pod.name),
                    timestamp: Instant::now(),
                });
            }
            None => {
                if data.failed_marks.insert(pod_key) {
                    trace!(pod = %pod.name, "no feasible node");
                    data.events.push(Event {
                        reason: EventReason::FailedScheduling,
                        pod_name: pod.name.clone(),
                        message: format!("no node satisfies pod {}/{}", pod.namespace, pod.name),
                        timestamp: Instant::now(),
                    });
                }
            }
        }
    }
}

/// Resource consumption per node from the pods already bound to it.
fn node_usage(pods: &BTreeMap<String, Pod>) -> BTreeMap<String, ResourceList> {
    let mut usage: BTreeMap<String, ResourceList> = BTreeMap::new();
    for pod in pods.values() {
        if pod.is_bound() {
            *usage.entry(pod.spec.node_name.clone()).or_default() += pod.total_requests();
        }
    }
    usage
}

/// Choose the feasible node that will be most packed (by memory) after
/// placement. Ties break on the lexicographically smaller node name.
fn pick_node(
    pod: &Pod,
    nodes: &BTreeMap<String, Node>,
    pods: &BTreeMap<String, Pod>,
    usage: &BTreeMap<String, ResourceList>,
) -> Option<String> {
    let requests = pod.total_requests();
    let mut best: Option<(f64, &str)> = None;

    for node in nodes.values() {
        if !tolerates_node(pod, node) {
            continue;
        }
        let used = usage.get(&node.name).copied().unwrap_or_default();
        let free = node.allocatable.saturating_sub(&used);
        if !requests.fits_within(&free) {
            continue;
        }
        if !spread_constraints_allow(pod, node, nodes, pods) {
            continue;
        }

        let allocatable_mem = node.allocatable.memory.as_f64();
        let packed = if allocatable_mem > 0.0 {
            (used.memory.as_f64() + requests.memory.as_f64()) / allocatable_mem
        } else {
            0.0
        };
        let better = match best {
            None => true,
            Some((best_packed, best_name)) => {
                packed > best_packed || (packed == best_packed && node.name.as_str() < best_name)
            }
        };
        if better {
            best = Some((packed, node.name.as_str()));
        }
    }

    best.map(|(_, name)| name.to_string())
}

/// Every `NoSchedule` taint on the node must be tolerated by the pod.
fn tolerates_node(pod: &Pod, node: &Node) -> bool {
    node.taints
        .iter()
        .filter(|t| t.effect == TaintEffect::NoSchedule)
        .all(|taint| pod.spec.tolerations.iter().any(|tol| tol.tolerates(taint)))
}

/// Evaluate the pod's `DoNotSchedule` topology spread constraints against
/// a candidate node.
fn spread_constraints_allow(
    pod: &Pod,
    candidate: &Node,
    nodes: &BTreeMap<String, Node>,
    pods: &BTreeMap<String, Pod>,
) -> bool {
    pod.spec
        .topology_spread_constraints
        .iter()
        .filter(|c| c.when_unsatisfiable == UnsatisfiableAction::DoNotSchedule)
        .all(|c| constraint_allows(c, pod, candidate, nodes, pods))
}

fn constraint_allows(
    constraint: &TopologySpreadConstraint,
    pod: &Pod,
    candidate: &Node,
    nodes: &BTreeMap<String, Node>,
    pods: &BTreeMap<String, Pod>,
) -> bool {
    let key = &constraint.topology_key;
    let candidate_domain = match candidate.labels.get(key) {
        Some(domain) => domain,
        // A node without the topology key cannot host the pod.
        None => return false,
    };

    // Domains the pod could land in: distinct key values over nodes the
    // pod tolerates.
    let domains: BTreeSet<&str> = nodes
        .values()
        .filter(|n| tolerates_node(pod, n))
        .filter_map(|n| n.labels.get(key).map(String::as_str))
        .collect();

    // Matching-pod count per domain.
    let mut counts: BTreeMap<&str, i64> = domains.iter().map(|d| (*d, 0)).collect();
    for other in pods.values() {
        if !other.is_bound() || !constraint.label_selector.matches(&other.labels) {
            continue;
        }
        if let Some(node) = nodes.get(&other.spec.node_name) {
            if let Some(domain) = node.labels.get(key) {
                if let Some(count) = counts.get_mut(domain.as_str()) {
                    *count += 1;
                }
            }
        }
    }

    // With fewer populated domains than minDomains, the global minimum is
    // treated as zero.
    let global_min = match constraint.min_domains {
        Some(min_domains) if (domains.len() as u32) < min_domains => 0,
        _ => counts.values().copied().min().unwrap_or(0),
    };

    let candidate_count = counts.get(candidate_domain.as_str()).copied().unwrap_or(0);
    candidate_count + 1 - global_min <= constraint.max_skew
}
