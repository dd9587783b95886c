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

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use imagecache_util::work_queue::QueueItem;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use uuid::Uuid;

use crate::image_cache::{ImageCache, object_key};

/// Job names starting with this prefix were never submitted to the cluster.
pub const SYNTHETIC_JOB_PREFIX: &str = "fakejob-";

/// Node label holding the hostname used to pin pull and delete jobs.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkType {
    Create,
    Update,
    Delete,
    StatusUpdate,
    Refresh,
    Purge,
}

impl WorkType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::StatusUpdate => "statusupdate",
            Self::Refresh => "refresh",
            Self::Purge => "purge",
        }
    }

    /// Only purge removes images from nodes. Every other work type ends up
    /// pulling.
    pub const fn removes_image(&self) -> bool {
        matches!(self, Self::Purge)
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a unit of image work. Real ids name a job submitted to the
/// cluster. Synthetic ids stand for work that needed no job, eg: an image
/// that was already present on its node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobId {
    Real(String),
    Synthetic(String),
}

impl JobId {
    pub fn synthetic() -> Self {
        Self::Synthetic(format!("{SYNTHETIC_JOB_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Classifies a job name read back from the cluster, eg: from a pod label.
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(SYNTHETIC_JOB_PREFIX) {
            Self::Synthetic(name.to_string())
        } else {
            Self::Real(name.to_string())
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Real(name) | Self::Synthetic(name) => name,
        }
    }

    pub const fn is_real(&self) -> bool {
        matches!(self, Self::Real(_))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single image to pull to, or remove from, a single node on behalf of an
/// image cache.
#[derive(Clone, Debug)]
pub struct ImageWorkRequest {
    pub image: String,
    pub node: Arc<Node>,
    /// Runtime reported by the node, eg: `containerd://1.7.2`.
    pub container_runtime_version: String,
    pub work_type: WorkType,
    pub image_cache: Arc<ImageCache>,
}

impl ImageWorkRequest {
    pub fn new(
        image: impl Into<String>,
        node: Arc<Node>,
        work_type: WorkType,
        image_cache: Arc<ImageCache>,
    ) -> Self {
        let container_runtime_version = node
            .status
            .as_ref()
            .and_then(|status| status.node_info.as_ref())
            .map(|info| info.container_runtime_version.clone())
            .unwrap_or_default();
        Self {
            image: image.into(),
            node,
            container_runtime_version,
            work_type,
            image_cache,
        }
    }

    /// Hostname of the target node, falling back to the node name.
    pub fn hostname(&self) -> String {
        self.node
            .labels()
            .get(HOSTNAME_LABEL)
            .cloned()
            .unwrap_or_else(|| self.node.name_any())
    }

    pub fn node_name(&self) -> String {
        self.node.name_any()
    }

    pub fn cache_key(&self) -> String {
        object_key(&self.image_cache)
    }
}

/// Item carried by the image work queue.
#[derive(Clone, Debug)]
pub enum ImageWorkItem {
    Image(ImageWorkRequest),
    /// Marks the end of a batch. Once dequeued, the results of every job of
    /// the cache are awaited and reported.
    Flush(Arc<ImageCache>),
}

impl ImageWorkItem {
    pub fn cache_key(&self) -> String {
        match self {
            Self::Image(request) => request.cache_key(),
            Self::Flush(image_cache) => object_key(image_cache),
        }
    }
}

/// Whether `queue_key` is the key of image work for the cache `cache_key`.
pub fn is_image_work_key(queue_key: &str, cache_key: &str) -> bool {
    queue_key
        .strip_prefix(cache_key)
        .is_some_and(|rest| rest.starts_with('/'))
}

impl QueueItem for ImageWorkItem {
    fn queue_key(&self) -> String {
        match self {
            Self::Image(request) => format!(
                "{}/{}/{}@{}",
                request.cache_key(),
                request.work_type,
                request.image,
                request.node_name()
            ),
            Self::Flush(image_cache) => format!("flush:{}", object_key(image_cache)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageWorkResultStatus {
    JobCreated,
    Succeeded,
    Failed,
    AlreadyPulled,
}

impl ImageWorkResultStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "jobcreated",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::AlreadyPulled => "alreadypulled",
        }
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::JobCreated)
    }
}

impl fmt::Display for ImageWorkResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ImageWorkResult {
    pub request: ImageWorkRequest,
    pub status: ImageWorkResultStatus,
    pub reason: String,
    pub message: String,
}

impl ImageWorkResult {
    pub const fn new(request: ImageWorkRequest, status: ImageWorkResultStatus) -> Self {
        Self {
            request,
            status,
            reason: String::new(),
            message: String::new(),
        }
    }

    /// `pull:- nginx:1.25 --> node-a, runtime: containerd://1.7.2`
    pub fn describe(&self) -> String {
        let action = if self.request.work_type.removes_image() {
            "delete"
        } else {
            "pull"
        };
        format!(
            "{action}:- {} --> {}, runtime: {}",
            self.request.image,
            self.request.hostname(),
            self.request.container_runtime_version
        )
    }
}

/// Results of one batch, keyed by job.
#[derive(Clone, Debug)]
pub struct ImageCacheStatusUpdate {
    pub obj_key: String,
    pub results: HashMap<JobId, ImageWorkResult>,
}

/// Item carried by the image cache reconcile queue.
#[derive(Clone, Debug)]
pub enum ReconcileRequest {
    Sync { work_type: WorkType, obj_key: String },
    StatusUpdate(Arc<ImageCacheStatusUpdate>),
}

impl ReconcileRequest {
    pub const fn work_type(&self) -> WorkType {
        match self {
            Self::Sync { work_type, .. } => *work_type,
            Self::StatusUpdate(_) => WorkType::StatusUpdate,
        }
    }

    pub fn obj_key(&self) -> &str {
        match self {
            Self::Sync { obj_key, .. } => obj_key,
            Self::StatusUpdate(update) => &update.obj_key,
        }
    }
}

impl QueueItem for ReconcileRequest {
    fn queue_key(&self) -> String {
        format!("{}/{}", self.work_type(), self.obj_key())
    }
}
