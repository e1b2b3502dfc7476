//! Per-request simulation state.

use std::collections::BTreeMap;

use gridup_core::constants::BIN_PACKING_SCHEDULER_NAME;
use gridup_core::{
    Node, NodePool, Pod, PodInfo, PodKey, PriorityClass, ScaleUpRecommendation, SimulationRequest,
    SortOrder,
};

/// Mutable bookkeeping for one recommendation request.
///
/// `scheduled_pods` and `unscheduled_pods` partition the supplied pods,
/// minus daemonset-owned and preempting pods which belong to neither.
/// `original_unscheduled_pods` is frozen at initialization. Only the
/// sequential recommendation loop mutates this state.
pub struct SimulationState {
    pub original_unscheduled_pods: BTreeMap<String, Pod>,
    pub existing_nodes: Vec<Node>,
    pub unscheduled_pods: Vec<Pod>,
    pub scheduled_pods: Vec<Pod>,
    /// Pools with remaining capacity (`current < max`), by name.
    pub eligible_node_pools: BTreeMap<String, NodePool>,
    pub priority_classes: Vec<PriorityClass>,
}

impl SimulationState {
    pub fn from_request(req: &SimulationRequest) -> Self {
        let pods = construct_pods(&req.pods, req.pod_order.unwrap_or_default());
        let (unscheduled_pods, scheduled_pods) = split_pods(pods);
        let original_unscheduled_pods = unscheduled_pods
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        let eligible_node_pools = req
            .node_pools
            .iter()
            .filter(|np| np.current < np.max)
            .map(|np| (np.name.clone(), np.clone()))
            .collect();

        SimulationState {
            original_unscheduled_pods,
            existing_nodes: req.nodes.clone(),
            unscheduled_pods,
            scheduled_pods,
            eligible_node_pools,
            priority_classes: req.priority_classes.clone(),
        }
    }

    /// Apply a committed recommendation to the eligible-pool set: bump
    /// `current` and drop the pool once it reaches `max`.
    pub fn update_eligible_pools(&mut self, rec: &ScaleUpRecommendation) {
        let Some(pool) = self.eligible_node_pools.get_mut(&rec.node_pool_name) else {
            return;
        };
        pool.current += rec.increment_by;
        if pool.current >= pool.max {
            self.eligible_node_pools.remove(&rec.node_pool_name);
        }
    }

    pub fn unscheduled_pod_keys(&self) -> Vec<PodKey> {
        self.unscheduled_pods.iter().map(Pod::key).collect()
    }

    /// Number of trials one round fans out to.
    pub fn total_zones_across_pools(&self) -> usize {
        self.eligible_node_pools
            .values()
            .map(|np| np.zones.len())
            .sum()
    }
}

/// Expand pod descriptors into pods and sort them by total memory request.
/// Descending order lands large pods first, which converges faster for
/// bin packing.
fn construct_pods(pod_infos: &[PodInfo], order: SortOrder) -> Vec<Pod> {
    let mut pods = Vec::new();
    for info in pod_infos {
        let count = info.count.max(1);
        for i in 0..count {
            let name = if count == 1 {
                info.name.clone()
            } else {
                format!("{}-{i}", info.name)
            };
            let mut spec = info.spec.clone();
            spec.scheduler_name = BIN_PACKING_SCHEDULER_NAME.to_string();
            pods.push(Pod {
                name: name.to_lowercase(),
                namespace: gridup_core::constants::DEFAULT_NAMESPACE.to_string(),
                labels: info.labels.clone(),
                owner_references: info.owner_references.clone(),
                spec,
                nominated_node_name: info.nominated_node_name.clone(),
            });
        }
    }
    sort_pods(&mut pods, order);
    pods
}

fn sort_pods(pods: &mut [Pod], order: SortOrder) {
    pods.sort_by_key(|p| {
        let memory = p.total_requests().memory.milli();
        match order {
            SortOrder::Asc => memory,
            SortOrder::Desc => -memory,
        }
    });
}

/// Partition pods into (unscheduled, scheduled). Daemonset-owned and
/// preempting pods are dropped from both.
fn split_pods(pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
    let mut unscheduled = Vec::new();
    let mut scheduled = Vec::new();
    for pod in pods {
        if pod.is_bound() {
            scheduled.push(pod);
        } else if pod.nominated_node_name.is_empty() && !pod.is_owned_by_daemon_set() {
            unscheduled.push(pod);
        }
    }
    (unscheduled, scheduled)
}
