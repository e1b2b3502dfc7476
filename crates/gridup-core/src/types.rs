//! Domain types shared across the gridup crates.
//!
//! Wire types (everything in `SimulationRequest` / `RecommendationResponse`)
//! use camelCase field names. The same `Node` and `Pod` structs double as
//! the virtual cluster's live objects.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::resources::ResourceList;

/// A named group of nodes of one instance type spanning one or more zones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,
    pub zones: BTreeSet<String>,
    pub max: u32,
    #[serde(default)]
    pub current: u32,
    pub instance_type: String,
}

/// Taint effect. Only `NoSchedule` influences the embedded scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Standard toleration matching: key must match (empty key + Exists
    /// tolerates everything), effect must match when set, and for `Equal`
    /// the values must agree.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match self.operator {
            TolerationOperator::Exists => self.key.is_empty() || self.key == taint.key,
            TolerationOperator::Equal => self.key == taint.key && self.value == taint.value,
        }
    }

    /// Toleration for exactly one `NoSchedule` taint key/value pair.
    pub fn equal(key: &str, value: &str) -> Toleration {
        Toleration {
            key: key.to_string(),
            operator: TolerationOperator::Equal,
            value: value.to_string(),
            effect: Some(TaintEffect::NoSchedule),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// True when every selector label is present on `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsatisfiableAction {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpreadConstraint {
    pub max_skew: i64,
    pub topology_key: String,
    pub when_unsatisfiable: UnsatisfiableAction,
    #[serde(default)]
    pub label_selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_domains: Option<u32>,
}

/// A single container's resource requests. Limits are irrelevant to
/// scheduling simulation and are not modelled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub requests: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub node_name: String,
    pub scheduler_name: String,
    pub containers: Vec<Container>,
    pub tolerations: Vec<Toleration>,
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

/// Incoming pod descriptor. `count > 1` expands into that many clones with
/// `-<i>` name suffixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    pub spec: PodSpec,
    #[serde(default)]
    pub nominated_node_name: String,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

/// A pod object inside the virtual cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    pub spec: PodSpec,
    #[serde(default)]
    pub nominated_node_name: String,
}

fn default_namespace() -> String {
    constants::DEFAULT_NAMESPACE.to_string()
}

impl Pod {
    /// Sum of resource requests across all containers, counting the pod
    /// itself against the node's pod capacity.
    pub fn total_requests(&self) -> ResourceList {
        let mut total = ResourceList::ZERO;
        for container in &self.spec.containers {
            total += container.requests;
        }
        total.pods = crate::resources::Quantity::from_units(1);
        total
    }

    pub fn is_bound(&self) -> bool {
        !self.spec.node_name.is_empty()
    }

    pub fn is_owned_by_daemon_set(&self) -> bool {
        self.owner_references
            .iter()
            .any(|or| or.kind == "DaemonSet" && or.api_version == "apps/v1")
    }

    pub fn key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// A node object inside the virtual cluster; doubles as the `nodes[]`
/// wire descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub allocatable: ResourceList,
    pub capacity: ResourceList,
}

impl Node {
    pub fn instance_type(&self) -> &str {
        self.labels
            .get(constants::INSTANCE_TYPE_LABEL_KEY)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn zone(&self) -> &str {
        self.labels
            .get(constants::TOPOLOGY_ZONE_LABEL_KEY)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Synthetic spec used to materialise a new node of a given (pool, zone).
/// Allocatable arrives already net of system reservations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    pub instance_type: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub allocatable: ResourceList,
    pub capacity: ResourceList,
    pub zone: String,
    #[serde(default)]
    pub region: String,
}

/// Priority class installed into the virtual cluster at request start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityClass {
    pub name: String,
    pub value: i32,
    #[serde(default)]
    pub global_default: bool,
    #[serde(default)]
    pub description: String,
}

/// Pod sort order applied before simulation, by total memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// A request to recommend scale-ups for one cluster snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub id: String,
    pub node_pools: Vec<NodePool>,
    #[serde(default)]
    pub priority_classes: Vec<PriorityClass>,
    #[serde(default)]
    pub pods: Vec<PodInfo>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Node templates keyed by an opaque identifier; looked up by zone plus
    /// the worker-pool label, not by key.
    #[serde(default)]
    pub node_templates: BTreeMap<String, NodeTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_order: Option<SortOrder>,
}

impl SimulationRequest {
    /// Find the template for a (pool, zone) pair: zone must match and the
    /// template's worker-pool label must name the pool.
    pub fn find_node_template(&self, pool_name: &str, zone: &str) -> Option<&NodeTemplate> {
        find_node_template(&self.node_templates, pool_name, zone)
    }
}

pub fn find_node_template<'a>(
    templates: &'a BTreeMap<String, NodeTemplate>,
    pool_name: &str,
    zone: &str,
) -> Option<&'a NodeTemplate> {
    templates.values().find(|nt| {
        nt.zone == zone
            && nt
                .labels
                .get(constants::WORKER_POOL_LABEL_KEY)
                .is_some_and(|p| p == pool_name)
    })
}

/// Namespace/name pair identifying a pod in the response envelope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpRecommendation {
    pub zone: String,
    pub node_pool_name: String,
    pub increment_by: u32,
    pub instance_type: String,
    #[serde(default)]
    pub node_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(default)]
    pub scale_up: Vec<ScaleUpRecommendation>,
    /// Reserved; the engine only produces scale-ups.
    #[serde(default)]
    pub scale_down: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    #[serde(default)]
    pub recommendation: Recommendation,
    #[serde(default)]
    pub unscheduled_pods: Vec<PodKey>,
    #[serde(default)]
    pub run_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
