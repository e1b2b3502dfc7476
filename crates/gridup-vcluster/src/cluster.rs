//! The virtual cluster handle and its operation surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use gridup_core::constants::NOT_READY_TAINT_KEY;
use gridup_core::{Node, Pod, PriorityClass, Taint, TaintEffect};

use crate::error::{ClusterError, ClusterResult};
use crate::scheduler;
use crate::store::{pod_key, ClusterData};

/// Handle to the embedded control plane. Cheap to clone; all clones share
/// one store and one scheduler task.
#[derive(Clone)]
pub struct VirtualCluster {
    inner: Arc<Inner>,
}

struct Inner {
    data: Arc<RwLock<ClusterData>>,
    scheduler_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl VirtualCluster {
    /// Create the cluster and start the embedded scheduler task.
    pub fn start() -> Self {
        Self::start_with_tick(scheduler::SCHEDULER_TICK)
    }

    /// Create the cluster with a custom scheduler pass interval.
    pub fn start_with_tick(tick: Duration) -> Self {
        let data = Arc::new(RwLock::new(ClusterData::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(scheduler::run(Arc::clone(&data), shutdown_rx, tick));
        info!("virtual cluster started");
        VirtualCluster {
            inner: Arc::new(Inner {
                data,
                scheduler_shutdown: Mutex::new(Some(shutdown_tx)),
            }),
        }
    }

    /// Stop the embedded scheduler. The store stays readable.
    pub async fn stop(&self) {
        if let Some(tx) = self.inner.scheduler_shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        info!("virtual cluster stopped");
    }

    /// Delete every node, pod, priority class, and event.
    /// Post-condition: the cluster is empty.
    pub async fn factory_reset(&self) -> ClusterResult<()> {
        self.data().write().await.clear();
        info!("virtual cluster factory reset");
        Ok(())
    }

    pub(crate) fn data(&self) -> &Arc<RwLock<ClusterData>> {
        &self.inner.data
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Create nodes. Every new node carries the not-ready `NoSchedule`
    /// taint; callers must untaint it explicitly (or use
    /// [`Self::create_and_untaint_nodes`]).
    pub async fn create_nodes(&self, nodes: &[Node]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for node in nodes {
            if data.nodes.contains_key(&node.name) {
                return Err(ClusterError::NodeExists(node.name.clone()));
            }
        }
        for node in nodes {
            let mut node = node.clone();
            if !node.taints.iter().any(|t| t.key == NOT_READY_TAINT_KEY) {
                node.taints.push(Taint {
                    key: NOT_READY_TAINT_KEY.to_string(),
                    value: String::new(),
                    effect: TaintEffect::NoSchedule,
                });
            }
            debug!(node = %node.name, "node created");
            data.nodes.insert(node.name.clone(), node);
        }
        Ok(())
    }

    /// Create nodes, then patch the given taint key off each of them.
    pub async fn create_and_untaint_nodes(
        &self,
        taint_key: &str,
        nodes: &[Node],
    ) -> ClusterResult<()> {
        self.create_nodes(nodes).await?;
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        self.untaint_nodes(taint_key, &names).await
    }

    /// Append a taint to the named nodes.
    pub async fn taint_nodes(&self, taint: Taint, node_names: &[String]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for name in node_names {
            let node = data
                .nodes
                .get_mut(name)
                .ok_or_else(|| ClusterError::NodeNotFound(name.clone()))?;
            node.taints.push(taint.clone());
        }
        Ok(())
    }

    /// Remove every taint with the given key from the named nodes.
    pub async fn untaint_nodes(&self, taint_key: &str, node_names: &[String]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for name in node_names {
            let node = data
                .nodes
                .get_mut(name)
                .ok_or_else(|| ClusterError::NodeNotFound(name.clone()))?;
            node.taints.retain(|t| t.key != taint_key);
        }
        Ok(())
    }

    pub async fn get_node(&self, name: &str) -> Option<Node> {
        self.data().read().await.nodes.get(name).cloned()
    }

    /// Snapshot of all nodes at call time.
    pub async fn list_nodes(&self) -> Vec<Node> {
        self.data().read().await.nodes.values().cloned().collect()
    }

    /// Snapshot of the nodes matching a predicate.
    pub async fn list_nodes_filtered(&self, filter: impl Fn(&Node) -> bool) -> Vec<Node> {
        self.data()
            .read()
            .await
            .nodes
            .values()
            .filter(|n| filter(n))
            .cloned()
            .collect()
    }

    /// Delete the named nodes. Missing names are not an error.
    pub async fn delete_nodes(&self, node_names: &[String]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for name in node_names {
            data.nodes.remove(name);
        }
        Ok(())
    }

    /// Delete every node whose labels contain all of `labels`.
    pub async fn delete_nodes_matching_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        data.nodes
            .retain(|_, node| !labels.iter().all(|(k, v)| node.labels.get(k) == Some(v)));
        Ok(())
    }

    pub async fn delete_all_nodes(&self) -> ClusterResult<()> {
        self.data().write().await.nodes.clear();
        Ok(())
    }

    // ── Pods ───────────────────────────────────────────────────────

    /// Create pods. Identity hygiene: priority fields are nulled and the
    /// termination grace period forced to zero on every create.
    pub async fn create_pods(&self, pods: &[Pod]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for pod in pods {
            if data.pods.contains_key(&pod_key(&pod.namespace, &pod.name)) {
                return Err(ClusterError::PodExists(pod.name.clone()));
            }
        }
        for pod in pods {
            let mut pod = pod.clone();
            pod.spec.priority_class_name = None;
            pod.spec.termination_grace_period_seconds = Some(0);
            debug!(pod = %pod.name, node = %pod.spec.node_name, "pod created");
            data.insert_pod(pod);
        }
        Ok(())
    }

    /// Fetch pods by name. Missing names are skipped, not errors; callers
    /// reconcile against the names they asked for.
    pub async fn get_pods_matching_names(&self, namespace: &str, names: &[String]) -> Vec<Pod> {
        let data = self.data().read().await;
        names
            .iter()
            .filter_map(|name| data.pods.get(&pod_key(namespace, name)).cloned())
            .collect()
    }

    pub async fn list_pods(&self) -> Vec<Pod> {
        self.data().read().await.pods.values().cloned().collect()
    }

    pub async fn list_pods_filtered(&self, filter: impl Fn(&Pod) -> bool) -> Vec<Pod> {
        self.data()
            .read()
            .await
            .pods
            .values()
            .filter(|p| filter(p))
            .cloned()
            .collect()
    }

    /// Delete the named pods. Missing names are not an error.
    pub async fn delete_pods_matching_names(
        &self,
        namespace: &str,
        names: &[String],
    ) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for name in names {
            data.remove_pod(namespace, name);
        }
        Ok(())
    }

    /// Delete every pod whose labels contain all of `labels`.
    pub async fn delete_pods_matching_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        let doomed: Vec<(String, String)> = data
            .pods
            .values()
            .filter(|p| labels.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
            .map(|p| (p.namespace.clone(), p.name.clone()))
            .collect();
        for (namespace, name) in doomed {
            data.remove_pod(&namespace, &name);
        }
        Ok(())
    }

    pub async fn delete_all_pods(&self) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        data.pods.clear();
        data.pod_seq.clear();
        data.failed_marks.clear();
        Ok(())
    }

    // ── Priority classes ───────────────────────────────────────────

    pub async fn create_priority_classes(&self, classes: &[PriorityClass]) -> ClusterResult<()> {
        let mut data = self.data().write().await;
        for pc in classes {
            data.priority_classes.insert(pc.name.clone(), pc.clone());
        }
        Ok(())
    }

    pub async fn list_priority_classes(&self) -> Vec<PriorityClass> {
        self.data()
            .read()
            .await
            .priority_classes
            .values()
            .cloned()
            .collect()
    }
}
