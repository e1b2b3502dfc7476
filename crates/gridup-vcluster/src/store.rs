//! Internal object store for the virtual cluster.

use std::collections::{BTreeMap, BTreeSet};

use gridup_core::{Node, Pod, PriorityClass};

use crate::events::Event;

/// Everything the virtual cluster holds, guarded by one `RwLock`.
///
/// Pods are keyed `namespace/name`. `pod_seq` preserves creation order so
/// the scheduler processes pending pods deterministically.
#[derive(Default)]
pub(crate) struct ClusterData {
    pub nodes: BTreeMap<String, Node>,
    pub pods: BTreeMap<String, Pod>,
    pub pod_seq: BTreeMap<String, u64>,
    pub next_seq: u64,
    pub priority_classes: BTreeMap<String, PriorityClass>,
    pub events: Vec<Event>,
    /// Pods the scheduler has already reported `FailedScheduling` for;
    /// cleared on bind or deletion so a changed situation re-reports.
    pub failed_marks: BTreeSet<String>,
}

pub(crate) fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl ClusterData {
    pub fn insert_pod(&mut self, pod: Pod) {
        let key = pod_key(&pod.namespace, &pod.name);
        self.pod_seq.insert(key.clone(), self.next_seq);
        self.next_seq += 1;
        self.pods.insert(key, pod);
    }

    pub fn remove_pod(&mut self, namespace: &str, name: &str) -> Option<Pod> {
        let key = pod_key(namespace, name);
        self.pod_seq.remove(&key);
        self.failed_marks.remove(&key);
        self.pods.remove(&key)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.pods.clear();
        self.pod_seq.clear();
        self.priority_classes.clear();
        self.events.clear();
        self.failed_marks.clear();
    }
}
