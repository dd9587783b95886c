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

use imagecache_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_duration_with_shellexpand, convert_nonzero_numeric_with_shellexpand,
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Policy used to decide whether an image is pulled onto a node that might
/// already have it. Images without a tag, or tagged `latest`, are always
/// pulled regardless of this value.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Pull every image, even when the node already reports it.
    Always,
    /// Only pull images that the node does not report as present.
    #[default]
    IfNotPresent,
}

impl ImagePullPolicy {
    /// The value used for `imagePullPolicy` in container specs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
        }
    }
}

fn default_namespace() -> String {
    "kube-fledged".to_string()
}

const fn default_image_pull_deadline_s() -> u64 {
    300
}

const fn default_status_poll_interval_ms() -> u64 {
    1000
}

fn default_cri_client_image() -> String {
    "senthilrch/kubefledged-cri-client:latest".to_string()
}

fn default_busybox_image() -> String {
    "busybox:1.29.2".to_string()
}

/// Configuration of the image manager.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ImageManagerConfig {
    /// Namespace in which image jobs are created and pods are watched.
    /// Default: "kube-fledged"
    #[serde(
        default = "default_namespace",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub namespace: String,

    /// Maximum time a pull or delete job may take. Jobs still running
    /// once this elapses are reported as failed.
    /// Accepts seconds or a duration string such as "5m".
    /// Default: 300 (seconds)
    #[serde(
        default = "default_image_pull_deadline_s",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub image_pull_deadline_s: u64,

    /// How often the work status is checked while waiting for the jobs
    /// of an image cache to finish. Must be greater than zero.
    /// Default: 1000 (milliseconds)
    #[serde(
        default = "default_status_poll_interval_ms",
        deserialize_with = "convert_nonzero_numeric_with_shellexpand"
    )]
    pub status_poll_interval_ms: u64,

    /// Pull policy applied to images that carry a specific tag.
    /// Default: IfNotPresent
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,

    /// Image holding the CRI client used by image delete jobs.
    #[serde(
        default = "default_cri_client_image",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub cri_client_image: String,

    /// Image used to provide the `echo` binary to image pull jobs.
    #[serde(
        default = "default_busybox_image",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub busybox_image: String,

    /// Service account assigned to job pods. When unset the namespace
    /// default service account is used.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub service_account_name: Option<String>,

    /// Retry behavior of the image work queue.
    #[serde(default)]
    pub work_queue: WorkQueueConfig,
}

impl Default for ImageManagerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image_pull_deadline_s: default_image_pull_deadline_s(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            image_pull_policy: ImagePullPolicy::default(),
            cri_client_image: default_cri_client_image(),
            busybox_image: default_busybox_image(),
            service_account_name: None,
            work_queue: WorkQueueConfig::default(),
        }
    }
}

impl ImageManagerConfig {
    /// # Errors
    ///
    /// Will return `Err` if we can't load the file.
    pub fn try_from_json5_file(config_file: &str) -> Result<Self, Error> {
        let json_contents = std::fs::read_to_string(config_file)
            .err_tip(|| format!("Could not open config file {config_file}"))?;
        Ok(serde_json5::from_str(&json_contents)?)
    }

    pub const fn image_pull_deadline(&self) -> Duration {
        Duration::from_secs(self.image_pull_deadline_s)
    }

    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_max_delay_ms() -> u64 {
    1_000_000
}

const fn default_max_retries() -> u32 {
    5
}

/// Exponential backoff applied when an item is put back on a work queue
/// after a failure.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkQueueConfig {
    /// Delay before the first retry. Each further failure doubles it.
    /// Default: 5 (milliseconds)
    #[serde(
        default = "default_base_delay_ms",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub base_delay_ms: u64,

    /// Upper bound of the retry delay.
    /// Default: 1000000 (milliseconds)
    #[serde(
        default = "default_max_delay_ms",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_delay_ms: u64,

    /// Number of times an item is retried before it is dropped.
    /// Default: 5
    #[serde(
        default = "default_max_retries",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_retries: u32,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}
