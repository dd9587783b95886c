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

#![allow(dead_code, reason = "shared by several test binaries")]

use std::collections::BTreeMap;
use std::sync::Arc;

use imagecache_manager::image_cache::{CacheSpecImages, ImageCache, ImageCacheSpec};
use imagecache_manager::work_item::{HOSTNAME_LABEL, ImageWorkRequest, WorkType};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Event, Node,
    NodeStatus, NodeSystemInfo, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const NAMESPACE: &str = "kube-fledged";
pub const RUNTIME_VERSION: &str = "containerd://1.7.2";

pub fn make_node(name: &str) -> Arc<Node> {
    Arc::new(Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                HOSTNAME_LABEL.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                container_runtime_version: RUNTIME_VERSION.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn make_image_cache(name: &str, images: &[&str]) -> Arc<ImageCache> {
    let mut image_cache = ImageCache::new(
        name,
        ImageCacheSpec {
            cache_spec: vec![CacheSpecImages {
                images: images.iter().map(ToString::to_string).collect(),
                node_selector: BTreeMap::new(),
            }],
            image_pull_secrets: Vec::new(),
        },
    );
    image_cache.metadata.namespace = Some(NAMESPACE.to_string());
    image_cache.metadata.uid = Some(format!("uid-{name}"));
    Arc::new(image_cache)
}

pub fn make_request(
    image: &str,
    node: &str,
    work_type: WorkType,
    image_cache: &Arc<ImageCache>,
) -> ImageWorkRequest {
    ImageWorkRequest::new(image, make_node(node), work_type, image_cache.clone())
}

pub fn make_pod(name: &str, job_name: &str, phase: &str, resource_version: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            resource_version: Some(resource_version.to_string()),
            labels: Some(BTreeMap::from([(
                "job-name".to_string(),
                job_name.to_string(),
            )])),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn with_container_state(mut pod: Pod, state: ContainerState) -> Pod {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.container_statuses = Some(vec![ContainerStatus {
        name: "image-puller".to_string(),
        state: Some(state),
        ..Default::default()
    }]);
    pod
}

pub fn waiting(reason: &str, message: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
        ..Default::default()
    }
}

pub fn terminated(reason: &str, message: &str) -> ContainerState {
    ContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code: 1,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn failed_event(message: &str) -> Event {
    Event {
        reason: Some("Failed".to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    }
}
