// Copyright 2025 The ImageCache Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::watcher;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::job_client::PodEventStream;
use crate::work_item::{ImageWorkResultStatus, JobId};
use crate::work_status_table::WorkStatusTable;

/// Label the job controller puts on the pods of a job.
pub const JOB_NAME_LABEL: &str = "job-name";
const JOB_NAME_LABEL_QUALIFIED: &str = "batch.kubernetes.io/job-name";

pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";
pub const POD_PHASE_PENDING: &str = "Pending";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PodState {
    resource_version: Option<String>,
    phase: Option<String>,
}

impl PodState {
    fn of(pod: &Pod) -> Self {
        Self {
            resource_version: pod.resource_version(),
            phase: pod_phase(pod).map(str::to_string),
        }
    }
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn is_terminal(phase: Option<&str>) -> bool {
    matches!(phase, Some(POD_PHASE_SUCCEEDED | POD_PHASE_FAILED))
}

/// Name of the job that created `pod`, if any.
pub fn job_name_of(pod: &Pod) -> Option<&str> {
    let labels = pod.metadata.labels.as_ref()?;
    labels
        .get(JOB_NAME_LABEL)
        .or_else(|| labels.get(JOB_NAME_LABEL_QUALIFIED))
        .map(String::as_str)
}

#[derive(Debug, Default)]
struct SeenPods {
    last_seen: HashMap<String, PodState>,
    /// Pods listed since the current relist began, if one is in progress.
    relisted: Option<HashSet<String>>,
}

/// Resolves work status entries as the pods of their jobs complete.
#[derive(Debug)]
pub struct PodStatusObserver {
    table: Arc<WorkStatusTable>,
    seen: Mutex<SeenPods>,
}

impl PodStatusObserver {
    pub fn new(table: Arc<WorkStatusTable>) -> Self {
        Self {
            table,
            seen: Mutex::new(SeenPods::default()),
        }
    }

    /// Number of pods whose last seen state is remembered.
    pub fn tracked_pods(&self) -> usize {
        self.seen.lock().last_seen.len()
    }

    /// Consumes `events` until `shutdown` fires or the stream ends. `synced`
    /// is signalled once the initial listing of pods has been delivered.
    pub async fn run(
        &self,
        mut events: PodEventStream,
        shutdown: CancellationToken,
        synced: Option<oneshot::Sender<()>>,
    ) {
        let mut synced = synced;
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Pod status observer shutting down");
                    return;
                }
                event = events.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    let init_done = matches!(event, watcher::Event::InitDone);
                    self.observe(event);
                    if init_done {
                        if let Some(synced) = synced.take() {
                            // Receiver is gone if startup was aborted.
                            let _ = synced.send(());
                        }
                    }
                }
                Some(Err(err)) => warn!(?err, "Error watching pods"),
                None => {
                    warn!("Pod watch stream ended");
                    return;
                }
            }
        }
    }

    pub fn observe(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Init => {
                self.seen.lock().relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(pod) => {
                {
                    let mut seen = self.seen.lock();
                    if let Some(relisted) = &mut seen.relisted {
                        relisted.insert(pod.name_any());
                    }
                }
                self.on_pod_update(&pod);
            }
            watcher::Event::InitDone => {
                let mut seen = self.seen.lock();
                if let Some(relisted) = seen.relisted.take() {
                    // Pods deleted while the watch was down never get a Delete.
                    seen.last_seen.retain(|name, _| relisted.contains(name));
                }
            }
            watcher::Event::Apply(pod) => self.on_pod_update(&pod),
            watcher::Event::Delete(pod) => {
                self.seen.lock().last_seen.remove(&pod.name_any());
            }
        }
    }

    fn on_pod_update(&self, pod: &Pod) {
        let new_state = PodState::of(pod);
        let old_state = self
            .seen
            .lock()
            .last_seen
            .insert(pod.name_any(), new_state.clone());
        if let Some(old_state) = &old_state {
            if old_state.resource_version == new_state.resource_version {
                return;
            }
        }
        let old_phase = old_state.as_ref().and_then(|state| state.phase.as_deref());
        if is_terminal(new_state.phase.as_deref()) && !is_terminal(old_phase) {
            self.handle_pod_status_change(pod);
        }
    }

    /// Records the terminal phase of `pod` against the entry of its job.
    pub fn handle_pod_status_change(&self, pod: &Pod) {
        let Some(job_name) = job_name_of(pod) else {
            trace!(pod = %pod.name_any(), "Ignoring pod without job");
            return;
        };
        let job_id = JobId::from_name(job_name);
        let succeeded = match pod_phase(pod) {
            Some(POD_PHASE_SUCCEEDED) => true,
            Some(POD_PHASE_FAILED) => false,
            _ => return,
        };
        let resolved = self.table.resolve_pending(&job_id, |result| {
            if succeeded {
                result.status = ImageWorkResultStatus::Succeeded;
                return;
            }
            result.status = ImageWorkResultStatus::Failed;
            let container_statuses = pod
                .status
                .as_ref()
                .and_then(|status| status.container_statuses.as_deref())
                .unwrap_or_default();
            if let [container_status] = container_statuses {
                if let Some(terminated) = container_status
                    .state
                    .as_ref()
                    .and_then(|state| state.terminated.as_ref())
                {
                    result.reason = terminated.reason.clone().unwrap_or_default();
                    result.message = terminated.message.clone().unwrap_or_default();
                }
            }
        });
        match resolved {
            Some(result) => info!(
                "Job {job_id} {} ({})",
                result.status,
                result.describe()
            ),
            None => debug!(%job_id, "No pending work for job"),
        }
    }
}
