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

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use imagecache_error::{Error, ResultExt, make_input_err};
use imagecache_util::work_queue::WorkQueue;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::image_cache::{
    ImageCache, ImageCacheActionStatus, ImageCacheStatus, NodeReasonMessage, split_object_key,
};
use crate::work_item::{ImageCacheStatusUpdate, ImageWorkResultStatus, ReconcileRequest, WorkType};

/// Work type of the batch that produced `update`.
pub fn batch_work_type(update: &ImageCacheStatusUpdate) -> WorkType {
    let mut work_types = update.results.values().map(|result| result.request.work_type);
    let Some(first) = work_types.next() else {
        return WorkType::StatusUpdate;
    };
    if first.removes_image() {
        return first;
    }
    work_types.find(WorkType::removes_image).unwrap_or(first)
}

const fn reason_for(work_type: WorkType) -> &'static str {
    match work_type {
        WorkType::Create => "ImageCacheCreate",
        WorkType::Update => "ImageCacheUpdate",
        WorkType::Delete => "ImageCacheDelete",
        WorkType::Refresh => "ImageCacheRefresh",
        WorkType::Purge => "ImageCachePurge",
        WorkType::StatusUpdate => "ImageCacheStatusUpdate",
    }
}

/// Folds the results of a batch into the status of its image cache.
pub fn summarize(update: &ImageCacheStatusUpdate) -> ImageCacheStatus {
    let work_type = batch_work_type(update);
    let mut failures: BTreeMap<String, Vec<NodeReasonMessage>> = BTreeMap::new();
    for result in update.results.values() {
        if result.status != ImageWorkResultStatus::Failed {
            continue;
        }
        failures
            .entry(result.request.image.clone())
            .or_default()
            .push(NodeReasonMessage {
                node: result.request.hostname(),
                reason: result.reason.clone(),
                message: result.message.clone(),
            });
    }
    for nodes in failures.values_mut() {
        nodes.sort_by(|a, b| a.node.cmp(&b.node));
    }

    let removes = work_type.removes_image();
    let (status, message) = match (failures.is_empty(), removes) {
        (true, false) => (
            ImageCacheActionStatus::Succeeded,
            "All requested images pulled successfully to respective nodes",
        ),
        (true, true) => (
            ImageCacheActionStatus::Succeeded,
            "All cached images successfully deleted from respective nodes",
        ),
        (false, false) => (
            ImageCacheActionStatus::Failed,
            "Image pull failed for some images. Please see \"failures\" section",
        ),
        (false, true) => (
            ImageCacheActionStatus::Failed,
            "Image deletion failed for some images. Please see \"failures\" section",
        ),
    };
    ImageCacheStatus {
        status: Some(status),
        reason: reason_for(work_type).to_string(),
        message: message.to_string(),
        failures,
        start_time: None,
        completion_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Applies aggregated batch results to the status of `ImageCache`
/// resources.
#[derive(Clone)]
pub struct StatusReporter {
    client: Client,
}

impl StatusReporter {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Consumes `queue` until it is shut down and drained, or shutdown is
    /// requested.
    pub async fn run(&self, queue: Arc<WorkQueue<ReconcileRequest>>, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                request = queue.get() => request,
            };
            let Some(request) = request else {
                break;
            };
            let result = match &request {
                ReconcileRequest::StatusUpdate(update) => self.report(update).await,
                ReconcileRequest::Sync { work_type, obj_key } => {
                    warn!(%work_type, obj_key = %obj_key, "No handler for image cache sync request");
                    Ok(())
                }
            };
            queue.done(&request);
            match result {
                Ok(()) => queue.forget(&request),
                Err(err) => {
                    error!(obj_key = request.obj_key(), ?err, "Failed to update image cache status");
                    queue.requeue_with_backoff(request);
                }
            }
        }
        debug!("Status reporter stopped");
    }

    /// Replaces the status of the image cache named by `update`.
    pub async fn report(&self, update: &ImageCacheStatusUpdate) -> Result<(), Error> {
        let (namespace, name) = split_object_key(&update.obj_key);
        let Some(namespace) = namespace else {
            return Err(make_input_err!(
                "Image cache key {} has no namespace",
                update.obj_key
            ));
        };
        let image_caches: Api<ImageCache> = Api::namespaced(self.client.clone(), namespace);
        let status = summarize(update);

        // A merge patch cannot drop stale map keys, so failures are cleared first.
        let clear_patch = serde_json::json!({
            "status": { "failures": null }
        });
        image_caches
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&clear_patch))
            .await
            .err_tip(|| format!("While clearing failures of {}", update.obj_key))?;

        let status_patch = serde_json::json!({
            "status": status
        });
        image_caches
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await
            .err_tip(|| format!("While updating status of {}", update.obj_key))?;

        info!(
            obj_key = %update.obj_key,
            status = ?status.status,
            failed_images = status.failures.len(),
            "Updated image cache status"
        );
        Ok(())
    }
}
