//! Node-template revision applied to incoming snapshots.
//!
//! Reserved amounts are operator policy, not engine constants: the daemon
//! passes them in from its flags.

use std::collections::BTreeMap;

use gridup_core::constants::MAX_PODS_PER_NODE;
use gridup_core::{NodeTemplate, Quantity, ResourceList};

/// Kube-reserved deductions applied to every node template.
#[derive(Debug, Clone)]
pub struct TemplateRevisionConfig {
    pub kube_reserved_cpu: Quantity,
    pub kube_reserved_memory: Quantity,
}

impl Default for TemplateRevisionConfig {
    fn default() -> Self {
        TemplateRevisionConfig {
            kube_reserved_cpu: "80m".parse().expect("valid default cpu reservation"),
            kube_reserved_memory: "1Gi".parse().expect("valid default memory reservation"),
        }
    }
}

/// Derive each template's allocatable from its capacity minus the
/// configured kube-reserved amounts, and normalise the pod capacity to
/// the platform cap.
pub fn revise_node_templates(
    templates: &mut BTreeMap<String, NodeTemplate>,
    config: &TemplateRevisionConfig,
) {
    let reserved = ResourceList {
        cpu: config.kube_reserved_cpu,
        memory: config.kube_reserved_memory,
        pods: Quantity::ZERO,
    };
    let pod_cap = Quantity::from_units(MAX_PODS_PER_NODE as i64);
    for template in templates.values_mut() {
        template.allocatable = template.capacity.saturating_sub(&reserved);
        template.allocatable.pods = pod_cap;
        template.capacity.pods = pod_cap;
    }
}
