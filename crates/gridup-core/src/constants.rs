//! Well-known names, labels, and taint keys.

/// Scheduler name stamped onto every pod the engine wants the embedded
/// bin-packing scheduler to pick up.
pub const BIN_PACKING_SCHEDULER_NAME: &str = "bin-packing-scheduler";

/// Namespace all virtual-cluster objects live in.
pub const DEFAULT_NAMESPACE: &str = "default";

pub const INSTANCE_TYPE_LABEL_KEY: &str = "node.kubernetes.io/instance-type";
pub const NOT_READY_TAINT_KEY: &str = "node.kubernetes.io/not-ready";
pub const TOPOLOGY_ZONE_LABEL_KEY: &str = "topology.kubernetes.io/zone";
pub const TOPOLOGY_HOST_LABEL_KEY: &str = "kubernetes.io/hostname";
pub const WORKER_POOL_LABEL_KEY: &str = "worker.gridup.io/pool";

/// Label key carried by every object a simulation trial creates. The value
/// is the trial's run-ref token.
pub const SIM_RUN_LABEL_KEY: &str = "app.kubernetes.io/simulation-run";

/// Platform cap applied to a node template's pod capacity.
pub const MAX_PODS_PER_NODE: u32 = 110;
