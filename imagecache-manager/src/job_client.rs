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

use async_trait::async_trait;
use futures::stream::BoxStream;
use imagecache_error::Error;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::runtime::watcher;

use crate::work_item::ImageWorkRequest;

/// Stream of pod changes in the namespace jobs are created in.
pub type PodEventStream = BoxStream<'static, Result<watcher::Event<Pod>, Error>>;

/// Everything the image manager needs from the cluster.
#[async_trait]
pub trait JobClient: Send + Sync + 'static {
    /// Submits a job pulling `request.image` onto `request.node`, returning
    /// the name of the created job.
    async fn create_pull_job(&self, request: &ImageWorkRequest) -> Result<String, Error>;

    /// Submits a job removing `request.image` from `request.node`, returning
    /// the name of the created job.
    async fn create_delete_job(&self, request: &ImageWorkRequest) -> Result<String, Error>;

    /// Whether the node already reports the image among its images.
    async fn image_present_on_node(&self, request: &ImageWorkRequest) -> Result<bool, Error>;

    /// Pods created for the job `job_name`.
    async fn list_pods(&self, job_name: &str) -> Result<Vec<Pod>, Error>;

    /// Failure events recorded against `pod`.
    async fn list_failure_events(&self, pod: &Pod) -> Result<Vec<Event>, Error>;

    /// Deletes the job `job_name` along with its pods. A job that no longer
    /// exists counts as deleted.
    async fn delete_job(&self, job_name: &str) -> Result<(), Error>;

    fn watch_pods(&self) -> PodEventStream;
}
