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

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Images to keep on every node matching `node_selector`. An empty selector
/// matches all nodes.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpecImages {
    pub images: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kubefledged.io",
    version = "v1alpha2",
    kind = "ImageCache",
    namespaced,
    status = "ImageCacheStatus",
    shortname = "ic",
    printcolumn = r#"{"name":"Status", "type":"string", "description":"Result of the last image cache action", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheSpec {
    pub cache_spec: Vec<CacheSpecImages>,

    /// Secrets used by pull jobs to authenticate against private registries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

/// Outcome of the last action taken on an image cache.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ImageCacheActionStatus {
    Processing,
    Succeeded,
    Failed,
    Unknown,
    Aborted,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeReasonMessage {
    pub node: String,
    pub reason: String,
    pub message: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheStatus {
    pub status: Option<ImageCacheActionStatus>,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    /// Failed nodes keyed by image.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, Vec<NodeReasonMessage>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    pub completion_time: Option<String>,
}

/// Key under which an image cache is queued, `<namespace>/<name>`, or just
/// `<name>` when the resource carries no namespace.
pub fn object_key(image_cache: &ImageCache) -> String {
    match image_cache.namespace() {
        Some(namespace) if !namespace.is_empty() => {
            format!("{namespace}/{}", image_cache.name_any())
        }
        _ => image_cache.name_any(),
    }
}

/// Splits a key produced by [`object_key`] into namespace and name.
pub fn split_object_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}
