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

use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use imagecache_error::{Code, Error, ResultExt, make_err};
use imagecache_util::background_spawn;
use imagecache_util::work_queue::WorkQueue;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job_client::JobClient;
use crate::pod_status_observer::{POD_PHASE_PENDING, pod_phase};
use crate::work_item::{
    ImageCacheStatusUpdate, ImageWorkResult, ImageWorkResultStatus, JobId, ReconcileRequest,
};
use crate::work_status_table::WorkStatusTable;

const PENDING_REASON: &str = "Pending";
const PENDING_MESSAGE: &str = "Check if node is ready";
const DEADLINE_EXCEEDED_REASON: &str = "DeadlineExceeded";

/// Waits for the jobs of a batch to finish, resolves the ones that missed the
/// deadline, deletes every job of the batch and reports the results.
#[derive(Debug)]
pub struct DeadlineReconciler<J: JobClient> {
    job_client: Arc<J>,
    table: Arc<WorkStatusTable>,
    reconcile_queue: Arc<WorkQueue<ReconcileRequest>>,
    deadline: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
    /// Caches with a run in progress.
    in_flight: Mutex<HashSet<String>>,
}

impl<J: JobClient> DeadlineReconciler<J> {
    pub fn new(
        job_client: Arc<J>,
        table: Arc<WorkStatusTable>,
        reconcile_queue: Arc<WorkQueue<ReconcileRequest>>,
        deadline: Duration,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            job_client,
            table,
            reconcile_queue,
            deadline,
            poll_interval,
            shutdown,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self, cache_key: &str) -> bool {
        self.in_flight.lock().contains(cache_key)
    }

    /// Starts a run for `cache_key` in the background. Returns `None` when a
    /// run for the same cache is already in progress.
    pub fn start(
        self: &Arc<Self>,
        cache_key: String,
    ) -> Option<oneshot::Receiver<Result<(), Error>>> {
        if !self.in_flight.lock().insert(cache_key.clone()) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let span_key = cache_key.clone();
        background_spawn!(
            "deadline_reconciler",
            async move {
                let result = this.run(&cache_key).await;
                this.in_flight.lock().remove(&cache_key);
                // Nobody may be waiting on the outcome.
                let _ = tx.send(result);
            },
            cache = %span_key
        );
        Some(rx)
    }

    /// Runs the batch of `cache_key` to completion. Every entry of the cache
    /// present when the wait ends is part of the batch.
    pub async fn run(&self, cache_key: &str) -> Result<(), Error> {
        debug!(cache = cache_key, "Waiting for jobs");
        self.wait_for_jobs(cache_key)
            .await
            .err_tip(|| format!("While waiting for jobs of {cache_key}"))?;

        let job_ids = self.table.job_ids_for(cache_key);
        self.resolve_expired_jobs(&job_ids)
            .await
            .err_tip(|| format!("While resolving expired jobs of {cache_key}"))?;
        let results = self
            .delete_jobs_and_take_results(cache_key, &job_ids)
            .await
            .err_tip(|| format!("While cleaning up jobs of {cache_key}"))?;

        info!(cache = cache_key, results = results.len(), "Image work completed");
        self.reconcile_queue
            .add(ReconcileRequest::StatusUpdate(Arc::new(ImageCacheStatusUpdate {
                obj_key: cache_key.to_string(),
                results,
            })));
        Ok(())
    }

    /// Returns once no entry of `cache_key` is pending or the deadline passed.
    async fn wait_for_jobs(&self, cache_key: &str) -> Result<(), Error> {
        let deadline = Instant::now() + self.deadline;
        loop {
            if !self.table.has_pending_for(cache_key) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(cache = cache_key, "Deadline passed with jobs still pending");
                return Ok(());
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    return Err(make_err!(Code::Cancelled, "Shutting down"));
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Marks every still pending entry of `job_ids` failed, with the reason
    /// read from its pod. Nothing is changed unless every entry resolves.
    async fn resolve_expired_jobs(&self, job_ids: &HashSet<JobId>) -> Result<(), Error> {
        let pending = self.table.pending(job_ids);
        if pending.is_empty() {
            return Ok(());
        }
        let mut resolutions = Vec::with_capacity(pending.len());
        for (job_id, mut result) in pending {
            let JobId::Real(job_name) = &job_id else {
                continue;
            };
            let pods = self
                .job_client
                .list_pods(job_name)
                .await
                .err_tip(|| format!("While listing pods of job {job_name}"))?;
            let pod = match pods.as_slice() {
                [pod] => pod,
                [] => {
                    return Err(make_err!(
                        Code::FailedPrecondition,
                        "No pods matched job {job_name}"
                    ));
                }
                _ => {
                    return Err(make_err!(
                        Code::FailedPrecondition,
                        "More than one pod matched job {job_name}"
                    ));
                }
            };
            result.status = ImageWorkResultStatus::Failed;
            self.apply_pod_reason(job_name, &mut result, pod);
            if !result.request.work_type.removes_image() {
                let events = self
                    .job_client
                    .list_failure_events(pod)
                    .await
                    .err_tip(|| format!("While listing events of pod {}", pod.name_any()))?;
                for message in events.iter().filter_map(|event| event.message.as_deref()) {
                    result.message.push(':');
                    result.message.push_str(message);
                }
            }
            info!("Job {job_id} expired ({})", result.describe());
            resolutions.push((job_id, result));
        }
        let resolved = self.table.resolve_all_pending(resolutions);
        debug!(resolved, "Resolved expired jobs");
        Ok(())
    }

    fn apply_pod_reason(&self, job_name: &str, result: &mut ImageWorkResult, pod: &Pod) {
        let container_statuses = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_deref())
            .unwrap_or_default();
        let phase = pod_phase(pod);
        if phase == Some(POD_PHASE_PENDING) {
            match container_statuses {
                [container_status] => {
                    if let Some(state) = &container_status.state {
                        if let Some(waiting) = &state.waiting {
                            result.reason = waiting.reason.clone().unwrap_or_default();
                            result.message = waiting.message.clone().unwrap_or_default();
                        } else if let Some(terminated) = &state.terminated {
                            result.reason = terminated.reason.clone().unwrap_or_default();
                            result.message = terminated.message.clone().unwrap_or_default();
                        }
                    }
                }
                _ => {
                    result.reason = PENDING_REASON.to_string();
                    result.message = PENDING_MESSAGE.to_string();
                    return;
                }
            }
        }
        if result.reason.is_empty() {
            result.reason = DEADLINE_EXCEEDED_REASON.to_string();
            result.message = format!(
                "Job {job_name} did not complete within {}s (pod phase: {})",
                self.deadline.as_secs(),
                phase.unwrap_or("Unknown")
            );
        }
    }

    /// Deletes the jobs of `job_ids` and removes their entries. Entries stay
    /// in the table when a delete fails, so a later run picks them up again.
    async fn delete_jobs_and_take_results(
        &self,
        cache_key: &str,
        job_ids: &HashSet<JobId>,
    ) -> Result<HashMap<JobId, ImageWorkResult>, Error> {
        for job_name in self.table.jobs_to_delete(job_ids) {
            self.job_client
                .delete_job(&job_name)
                .await
                .err_tip(|| format!("While deleting job {job_name}"))?;
            debug!(job = %job_name, "Deleted job");
            self.table.mark_job_deleted(&JobId::Real(job_name));
        }
        let results = self.table.snapshot_and_clear(job_ids);
        if results.is_empty() {
            warn!(cache = cache_key, "No work recorded for image cache");
            return Err(make_err!(
                Code::NotFound,
                "Unable to obtain reference to image cache {cache_key}"
            ));
        }
        Ok(results)
    }
}
