//! Node scoring strategies.
//!
//! A scorer is a pure function from (candidate node, candidate pods) to a
//! score. Every strategy is a minimiser: the round orchestrator commits
//! the trial with the smallest cumulative score.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use gridup_core::{Node, NodePool, Pod};
use gridup_pricing::PricingCatalog;

/// Weight of one cpu core in resource units.
pub const RESOURCE_UNITS_PER_CPU_CORE: f64 = 5.0;
/// Weight of one GiB of memory in resource units.
pub const RESOURCE_UNITS_PER_MEMORY_GIB: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringStrategy {
    CostOnly,
    LeastCostPerUnit,
    CostCpuMemWastage,
}

impl ScoringStrategy {
    pub const ALL: [ScoringStrategy; 3] = [
        ScoringStrategy::CostOnly,
        ScoringStrategy::LeastCostPerUnit,
        ScoringStrategy::CostCpuMemWastage,
    ];
}

impl fmt::Display for ScoringStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ScoringStrategy::CostOnly => "cost-only",
            ScoringStrategy::LeastCostPerUnit => "least-cost-per-unit",
            ScoringStrategy::CostCpuMemWastage => "cost-cpu-mem-wastage",
        };
        f.write_str(tag)
    }
}

impl FromStr for ScoringStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost-only" => Ok(ScoringStrategy::CostOnly),
            "least-cost-per-unit" => Ok(ScoringStrategy::LeastCostPerUnit),
            "cost-cpu-mem-wastage" => Ok(ScoringStrategy::CostCpuMemWastage),
            other => Err(format!("unknown scoring strategy {other:?}")),
        }
    }
}

/// Score for one candidate node placement. Lower is better.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeScore {
    pub cumulative: f64,
    pub mem_waste_ratio: f64,
    pub cpu_waste_ratio: f64,
    pub unscheduled_ratio: f64,
    pub cost_ratio: f64,
}

/// Pure scoring contract. Implementations never mutate their inputs.
pub trait Scorer: Send + Sync {
    fn strategy(&self) -> ScoringStrategy;

    /// Score the scaled node given the trial's candidate pods (bound and
    /// unbound alike).
    fn compute(&self, scaled_node: &Node, candidate_pods: &[Pod]) -> NodeScore;
}

/// Build a scorer for the strategy, priced for the request's pools.
pub fn build_scorer(
    strategy: ScoringStrategy,
    catalog: &PricingCatalog,
    pools: &[NodePool],
) -> Box<dyn Scorer> {
    match strategy {
        ScoringStrategy::CostOnly => Box::new(CostOnlyScorer {
            instance_type_costs: catalog.costs_for_pools(pools),
        }),
        ScoringStrategy::LeastCostPerUnit => Box::new(LeastCostPerUnitScorer {
            instance_type_costs: catalog.costs_for_pools(pools),
        }),
        ScoringStrategy::CostCpuMemWastage => Box::new(CostCpuMemWastageScorer {
            instance_type_cost_ratios: catalog.cost_ratios_for_pools(pools),
        }),
    }
}

fn price_or_zero(costs: &HashMap<String, f64>, instance_type: &str) -> f64 {
    match costs.get(instance_type) {
        Some(price) => *price,
        None => {
            warn!(instance_type, "no price for instance type, scoring as 0");
            0.0
        }
    }
}

/// Resource units a pod contributes when bound to the scaled node.
fn resource_units_on_node(node: &Node, candidate_pods: &[Pod]) -> f64 {
    candidate_pods
        .iter()
        .filter(|p| p.spec.node_name == node.name)
        .map(|p| {
            let requests = p.total_requests();
            requests.memory.gib() * RESOURCE_UNITS_PER_MEMORY_GIB
                + requests.cpu.as_f64() * RESOURCE_UNITS_PER_CPU_CORE
        })
        .sum()
}

/// Score = on-demand price of the node's instance type.
struct CostOnlyScorer {
    instance_type_costs: HashMap<String, f64>,
}

impl Scorer for CostOnlyScorer {
    fn strategy(&self) -> ScoringStrategy {
        ScoringStrategy::CostOnly
    }

    fn compute(&self, scaled_node: &Node, _candidate_pods: &[Pod]) -> NodeScore {
        NodeScore {
            cumulative: price_or_zero(&self.instance_type_costs, scaled_node.instance_type()),
            ..NodeScore::default()
        }
    }
}

/// Score = price divided by the resource units actually scheduled onto the
/// node; infinite when the node attracted nothing.
struct LeastCostPerUnitScorer {
    instance_type_costs: HashMap<String, f64>,
}

impl Scorer for LeastCostPerUnitScorer {
    fn strategy(&self) -> ScoringStrategy {
        ScoringStrategy::LeastCostPerUnit
    }

    fn compute(&self, scaled_node: &Node, candidate_pods: &[Pod]) -> NodeScore {
        let price = price_or_zero(&self.instance_type_costs, scaled_node.instance_type());
        let units = resource_units_on_node(scaled_node, candidate_pods);
        let cumulative = if units > 0.0 {
            price / units
        } else {
            f64::INFINITY
        };
        NodeScore {
            cumulative,
            ..NodeScore::default()
        }
    }
}

/// Score = memory waste ratio plus the unscheduled ratio weighted by the
/// instance type's share of pool prices.
struct CostCpuMemWastageScorer {
    instance_type_cost_ratios: HashMap<String, f64>,
}

impl Scorer for CostCpuMemWastageScorer {
    fn strategy(&self) -> ScoringStrategy {
        ScoringStrategy::CostCpuMemWastage
    }

    fn compute(&self, scaled_node: &Node, candidate_pods: &[Pod]) -> NodeScore {
        let cost_ratio = price_or_zero(&self.instance_type_cost_ratios, scaled_node.instance_type());
        let (mem_waste_ratio, cpu_waste_ratio) = waste_ratios(scaled_node, candidate_pods);
        let unscheduled_ratio = unscheduled_ratio(candidate_pods);
        NodeScore {
            cumulative: mem_waste_ratio + unscheduled_ratio * cost_ratio,
            mem_waste_ratio,
            cpu_waste_ratio,
            unscheduled_ratio,
            cost_ratio,
        }
    }
}

fn waste_ratios(node: &Node, candidate_pods: &[Pod]) -> (f64, f64) {
    let mut mem_consumed = 0.0;
    let mut cpu_consumed = 0.0;
    for pod in candidate_pods {
        if pod.spec.node_name == node.name {
            let requests = pod.total_requests();
            mem_consumed += requests.memory.as_f64();
            cpu_consumed += requests.cpu.as_f64();
        }
    }
    let mem_capacity = node.capacity.memory.as_f64();
    let cpu_capacity = node.capacity.cpu.as_f64();
    let mem_waste = if mem_capacity > 0.0 {
        (mem_capacity - mem_consumed) / mem_capacity
    } else {
        0.0
    };
    let cpu_waste = if cpu_capacity > 0.0 {
        (cpu_capacity - cpu_consumed) / cpu_capacity
    } else {
        0.0
    };
    (mem_waste, cpu_waste)
}

fn unscheduled_ratio(candidate_pods: &[Pod]) -> f64 {
    if candidate_pods.is_empty() {
        return 0.0;
    }
    let unbound = candidate_pods.iter().filter(|p| !p.is_bound()).count();
    unbound as f64 / candidate_pods.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridup_core::constants::INSTANCE_TYPE_LABEL_KEY;
    use gridup_core::{Container, PodSpec, Quantity, ResourceList};
    use std::collections::{BTreeMap, BTreeSet};

    fn node(name: &str, instance_type: &str, cpu: &str, memory: &str) -> Node {
        let mut labels = BTreeMap::new();
        labels.insert(INSTANCE_TYPE_LABEL_KEY.to_string(), instance_type.to_string());
        Node {
            name: name.to_string(),
            labels,
            taints: vec![],
            allocatable: ResourceList {
                cpu: cpu.parse().unwrap(),
                memory: memory.parse().unwrap(),
                pods: Quantity::from_units(110),
            },
            capacity: ResourceList {
                cpu: cpu.parse().unwrap(),
                memory: memory.parse().unwrap(),
                pods: Quantity::from_units(110),
            },
        }
    }

    fn pod_on(name: &str, node_name: &str, cpu: &str, memory: &str) -> Pod {
        Pod {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            owner_references: vec![],
            spec: PodSpec {
                node_name: node_name.to_string(),
                containers: vec![Container {
                    name: "c".to_string(),
                    requests: ResourceList::new(cpu.parse().unwrap(), memory.parse().unwrap()),
                }],
                ..PodSpec::default()
            },
            nominated_node_name: String::new(),
        }
    }

    fn pools(entries: &[(&str, &str)]) -> Vec<NodePool> {
        entries
            .iter()
            .map(|(name, instance_type)| NodePool {
                name: name.to_string(),
                zones: BTreeSet::from(["a".to_string()]),
                max: 3,
                current: 0,
                instance_type: instance_type.to_string(),
            })
            .collect()
    }

    fn catalog() -> PricingCatalog {
        PricingCatalog::builtin("aws").unwrap()
    }

    #[test]
    fn cost_only_scores_by_price() {
        let catalog = catalog();
        let pools = pools(&[("p1", "m5.large"), ("p2", "m5.4xlarge")]);
        let scorer = build_scorer(ScoringStrategy::CostOnly, &catalog, &pools);

        let cheap = scorer.compute(&node("n1", "m5.large", "2", "8Gi"), &[]);
        let pricey = scorer.compute(&node("n2", "m5.4xlarge", "16", "64Gi"), &[]);
        assert!(cheap.cumulative < pricey.cumulative);
    }

    #[test]
    fn cost_only_unknown_instance_scores_zero() {
        let catalog = catalog();
        let pools = pools(&[("p1", "mystery.large")]);
        let scorer = build_scorer(ScoringStrategy::CostOnly, &catalog, &pools);
        let score = scorer.compute(&node("n1", "mystery.large", "2", "8Gi"), &[]);
        assert_eq!(score.cumulative, 0.0);
    }

    #[test]
    fn least_cost_per_unit_is_infinite_with_no_pods() {
        let catalog = catalog();
        let pools = pools(&[("p1", "m5.large")]);
        let scorer = build_scorer(ScoringStrategy::LeastCostPerUnit, &catalog, &pools);
        let score = scorer.compute(&node("n1", "m5.large", "2", "8Gi"), &[]);
        assert!(score.cumulative.is_infinite());
    }

    #[test]
    fn least_cost_per_unit_improves_with_more_pods_bound() {
        let catalog = catalog();
        let pools = pools(&[("p1", "m5.large")]);
        let scorer = build_scorer(ScoringStrategy::LeastCostPerUnit, &catalog, &pools);
        let n = node("n1", "m5.large", "2", "8Gi");

        let one = scorer.compute(&n, &[pod_on("a", "n1", "100m", "2Gi")]);
        let two = scorer.compute(
            &n,
            &[
                pod_on("a", "n1", "100m", "2Gi"),
                pod_on("b", "n1", "100m", "2Gi"),
            ],
        );
        assert!(two.cumulative < one.cumulative);
    }

    #[test]
    fn wastage_penalises_empty_nodes() {
        let catalog = catalog();
        let pools = pools(&[("p1", "m5.large")]);
        let scorer = build_scorer(ScoringStrategy::CostCpuMemWastage, &catalog, &pools);
        let n = node("n1", "m5.large", "2", "8Gi");

        let packed = scorer.compute(
            &n,
            &[
                pod_on("a", "n1", "100m", "4Gi"),
                pod_on("b", "n1", "100m", "3Gi"),
            ],
        );
        let wasteful = scorer.compute(&n, &[pod_on("a", "n1", "100m", "1Gi")]);
        assert!(packed.cumulative < wasteful.cumulative);
        assert!(packed.mem_waste_ratio < wasteful.mem_waste_ratio);
    }

    #[test]
    fn wastage_counts_unscheduled_pods_against_the_node() {
        let catalog = catalog();
        let pools = pools(&[("p1", "m5.large")]);
        let scorer = build_scorer(ScoringStrategy::CostCpuMemWastage, &catalog, &pools);
        let n = node("n1", "m5.large", "2", "8Gi");

        let all_bound = scorer.compute(
            &n,
            &[
                pod_on("a", "n1", "100m", "2Gi"),
                pod_on("b", "n1", "100m", "2Gi"),
            ],
        );
        let half_bound = scorer.compute(
            &n,
            &[
                pod_on("a", "n1", "100m", "2Gi"),
                pod_on("b", "", "100m", "2Gi"),
            ],
        );
        assert_eq!(all_bound.unscheduled_ratio, 0.0);
        assert_eq!(half_bound.unscheduled_ratio, 0.5);
        assert!(all_bound.cumulative < half_bound.cumulative);
    }

    #[test]
    fn strategy_tags_round_trip() {
        for strategy in ScoringStrategy::ALL {
            let parsed: ScoringStrategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert!("carbon-aware".parse::<ScoringStrategy>().is_err());
    }
}
