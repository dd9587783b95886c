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
use std::sync::Arc;

use imagecache_config::image_manager::ImagePullPolicy;
use imagecache_error::{Error, ResultExt};
use imagecache_util::background_spawn;
use imagecache_util::work_queue::{QueueItem, WorkQueue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deadline_reconciler::DeadlineReconciler;
use crate::job_client::JobClient;
use crate::pull_policy::image_needs_pull;
use crate::work_item::{
    ImageWorkItem, ImageWorkRequest, ImageWorkResult, ImageWorkResultStatus, JobId, WorkType,
    is_image_work_key,
};
use crate::work_status_table::WorkStatusTable;

/// Single consumer of the image work queue. Turns each request into a job,
/// or a synthetic entry when no job is needed, and hands finished batches
/// to the [`DeadlineReconciler`].
#[derive(Debug)]
pub struct ImageWorkDispatcher<J: JobClient> {
    job_client: Arc<J>,
    table: Arc<WorkStatusTable>,
    queue: Arc<WorkQueue<ImageWorkItem>>,
    reconciler: Arc<DeadlineReconciler<J>>,
    image_pull_policy: ImagePullPolicy,
    /// Delay before a flush is retried while image work of its cache is
    /// still outstanding or the previous run of the cache is in progress.
    flush_retry_delay: Duration,
    shutdown: CancellationToken,
}

impl<J: JobClient> ImageWorkDispatcher<J> {
    pub const fn new(
        job_client: Arc<J>,
        table: Arc<WorkStatusTable>,
        queue: Arc<WorkQueue<ImageWorkItem>>,
        reconciler: Arc<DeadlineReconciler<J>>,
        image_pull_policy: ImagePullPolicy,
        flush_retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            job_client,
            table,
            queue,
            reconciler,
            image_pull_policy,
            flush_retry_delay,
            shutdown,
        }
    }

    /// Processes items until the queue is shut down or shutdown is requested.
    pub async fn run(&self) {
        while self.process_next_work_item().await {}
        debug!(queue = %self.queue.name(), "Dispatcher stopped");
    }

    /// Processes one item. Returns `false` once no more items will come.
    pub async fn process_next_work_item(&self) -> bool {
        let item = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return false,
            item = self.queue.get() => item,
        };
        let Some(item) = item else {
            return false;
        };
        let result = self.process_work_item(&item).await;
        self.queue.done(&item);
        if let Err(err) = result {
            error!(key = %item.queue_key(), ?err, "Failed to process image work item");
            self.queue.requeue_with_backoff(item);
        }
        true
    }

    async fn process_work_item(&self, item: &ImageWorkItem) -> Result<(), Error> {
        match item {
            ImageWorkItem::Flush(_) => {
                self.queue.forget(item);
                let cache_key = item.cache_key();
                if self
                    .queue
                    .has_outstanding(|key| is_image_work_key(key, &cache_key))
                {
                    debug!(cache = %cache_key, "Image work still queued, delaying flush");
                    self.queue.add_after(item.clone(), self.flush_retry_delay);
                    return Ok(());
                }
                match self.reconciler.start(cache_key.clone()) {
                    Some(outcome) => {
                        background_spawn!(
                            "deadline_reconciler_outcome",
                            async move {
                                match outcome.await {
                                    Ok(Ok(())) => debug!("Deadline reconciler finished"),
                                    Ok(Err(err)) => error!(?err, "Deadline reconciler failed"),
                                    Err(_) => error!("Deadline reconciler dropped its outcome"),
                                }
                            },
                            cache = %cache_key
                        );
                    }
                    None => {
                        debug!(cache = %cache_key, "Previous batch still running, delaying flush");
                        self.queue.add_after(item.clone(), self.flush_retry_delay);
                    }
                }
                Ok(())
            }
            ImageWorkItem::Image(request) if request.work_type == WorkType::StatusUpdate => {
                warn!(
                    cache = %request.cache_key(),
                    image = %request.image,
                    "Discarding status update on the image work queue"
                );
                self.queue.forget(item);
                Ok(())
            }
            ImageWorkItem::Image(request) => {
                let job_id = self.dispatch(request).await?;
                debug!(%job_id, "Dispatched image work");
                self.queue.forget(item);
                Ok(())
            }
        }
    }

    /// Creates the job a request needs and records it as pending, or records
    /// a synthetic entry when the image is already on the node.
    pub async fn dispatch(&self, request: &ImageWorkRequest) -> Result<JobId, Error> {
        let (job_id, status) = if request.work_type.removes_image() {
            let job_name = self
                .job_client
                .create_delete_job(request)
                .await
                .err_tip(|| format!("While creating delete job for {}", request.image))?;
            (JobId::Real(job_name), ImageWorkResultStatus::JobCreated)
        } else if image_needs_pull(self.image_pull_policy, &request.image, || {
            self.job_client.image_present_on_node(request)
        })
        .await
        .err_tip(|| format!("While checking {} on {}", request.image, request.node_name()))?
        {
            let job_name = self
                .job_client
                .create_pull_job(request)
                .await
                .err_tip(|| format!("While creating pull job for {}", request.image))?;
            (JobId::Real(job_name), ImageWorkResultStatus::JobCreated)
        } else {
            (JobId::synthetic(), ImageWorkResultStatus::AlreadyPulled)
        };

        let result = ImageWorkResult::new(request.clone(), status);
        match status {
            ImageWorkResultStatus::JobCreated => {
                info!("Job {job_id} created ({})", result.describe());
            }
            _ => info!("Image already present ({})", result.describe()),
        }
        self.table.insert(job_id.clone(), result);
        Ok(job_id)
    }
}
