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

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use imagecache_config::image_manager::{ImageManagerConfig, ImagePullPolicy};
use imagecache_error::{Code, Error, ResultExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Event, HostPathVolumeSource, LocalObjectReference, Node, Pod,
    PodSpec, PodTemplateSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::debug;

use crate::job_client::{JobClient, PodEventStream};
use crate::pod_status_observer::JOB_NAME_LABEL;
use crate::work_item::{HOSTNAME_LABEL, ImageWorkRequest};

const APP_LABEL: &str = "app";
const APP_LABEL_VALUE: &str = "imagecache";
const IMAGE_CACHE_LABEL: &str = "imagecache";
const ECHO_VOLUME: &str = "tmp-bin";
const ECHO_MOUNT_PATH: &str = "/tmp/bin";
const RUNTIME_SOCKET_VOLUME: &str = "runtime-sock";

/// Container runtime socket of a node, and the command removing an image
/// through it.
#[derive(Debug, PartialEq, Eq)]
pub struct RuntimeSocket {
    pub path: &'static str,
    pub command: Vec<String>,
}

/// Picks the socket and CLI matching `container_runtime_version`, eg:
/// `containerd://1.7.2` or `docker://24.0.5`. Unknown runtimes are assumed
/// to speak CRI over the containerd socket.
pub fn runtime_socket(container_runtime_version: &str, image: &str) -> RuntimeSocket {
    let runtime = container_runtime_version
        .split_once("://")
        .map_or(container_runtime_version, |(runtime, _)| runtime);
    let crictl = |path: &'static str| RuntimeSocket {
        path,
        command: vec![
            "crictl".to_string(),
            "--runtime-endpoint".to_string(),
            format!("unix://{path}"),
            "rmi".to_string(),
            image.to_string(),
        ],
    };
    match runtime {
        "docker" => RuntimeSocket {
            path: "/var/run/docker.sock",
            command: vec![
                "docker".to_string(),
                "image".to_string(),
                "rm".to_string(),
                image.to_string(),
            ],
        },
        "cri-o" | "crio" => crictl("/var/run/crio/crio.sock"),
        _ => crictl("/run/containerd/containerd.sock"),
    }
}

/// Fully qualified form of an image name, eg: `nginx:1.25` becomes
/// `docker.io/library/nginx:1.25`.
pub fn normalize_image_name(image: &str) -> String {
    let (first, rest) = match image.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (image, None),
    };
    let is_registry = |segment: &str| {
        segment.contains('.') || segment.contains(':') || segment == "localhost"
    };
    match rest {
        Some(_) if is_registry(first) => image.to_string(),
        Some(_) => format!("docker.io/{image}"),
        None => format!("docker.io/library/{image}"),
    }
}

/// Whether `node` lists `image` among the images it holds.
pub fn node_has_image(node: &Node, image: &str) -> bool {
    let wanted = normalize_image_name(image);
    node.status
        .as_ref()
        .and_then(|status| status.images.as_ref())
        .into_iter()
        .flatten()
        .flat_map(|container_image| container_image.names.iter().flatten())
        .any(|name| name == image || normalize_image_name(name) == wanted)
}

/// [`JobClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeJobClient {
    client: Client,
    namespace: String,
    busybox_image: String,
    cri_client_image: String,
    image_pull_policy: ImagePullPolicy,
    active_deadline_seconds: i64,
    service_account_name: Option<String>,
}

impl KubeJobClient {
    pub fn new(client: Client, config: &ImageManagerConfig) -> Result<Self, Error> {
        let active_deadline_seconds = i64::try_from(config.image_pull_deadline_s)
            .err_tip(|| "image_pull_deadline_s is too large")?;
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            busybox_image: config.busybox_image.clone(),
            cri_client_image: config.cri_client_image.clone(),
            image_pull_policy: config.image_pull_policy,
            active_deadline_seconds,
            service_account_name: config.service_account_name.clone(),
        })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn job_metadata(&self, request: &ImageWorkRequest) -> ObjectMeta {
        let image_cache = &request.image_cache;
        let labels = BTreeMap::from([
            (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
            (IMAGE_CACHE_LABEL.to_string(), image_cache.name_any()),
        ]);
        // Owner references cannot cross namespaces.
        let owner_references = (image_cache.namespace().as_deref() == Some(self.namespace.as_str()))
            .then(|| image_cache.controller_owner_ref(&()))
            .flatten()
            .map(|owner_ref| vec![owner_ref]);
        ObjectMeta {
            generate_name: Some(format!("imagecache-{}-", image_cache.name_any())),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references,
            ..Default::default()
        }
    }

    fn job_spec(&self, request: &ImageWorkRequest, pod_spec: PodSpec) -> JobSpec {
        let labels = BTreeMap::from([
            (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
            (IMAGE_CACHE_LABEL.to_string(), request.image_cache.name_any()),
        ]);
        JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(self.active_deadline_seconds),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: Some(BTreeMap::from([(
                        HOSTNAME_LABEL.to_string(),
                        request.hostname(),
                    )])),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: self.service_account_name.clone(),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    ..pod_spec
                }),
            },
            ..Default::default()
        }
    }

    /// Job running the cached image with a copied `echo`, which forces the
    /// kubelet to pull the image onto the node.
    pub fn pull_job_manifest(&self, request: &ImageWorkRequest) -> Job {
        let echo_mount = VolumeMount {
            name: ECHO_VOLUME.to_string(),
            mount_path: ECHO_MOUNT_PATH.to_string(),
            ..Default::default()
        };
        let image_pull_secrets = request
            .image_cache
            .spec
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect::<Vec<_>>();
        let pod_spec = PodSpec {
            init_containers: Some(vec![Container {
                name: "busybox".to_string(),
                image: Some(self.busybox_image.clone()),
                command: Some(vec![
                    "cp".to_string(),
                    "/bin/echo".to_string(),
                    ECHO_MOUNT_PATH.to_string(),
                ]),
                volume_mounts: Some(vec![echo_mount.clone()]),
                image_pull_policy: Some(ImagePullPolicy::IfNotPresent.as_str().to_string()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "image-puller".to_string(),
                image: Some(request.image.clone()),
                command: Some(vec![
                    format!("{ECHO_MOUNT_PATH}/echo"),
                    "Image pulled successfully!".to_string(),
                ]),
                volume_mounts: Some(vec![echo_mount]),
                image_pull_policy: Some(self.image_pull_policy.as_str().to_string()),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: ECHO_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            image_pull_secrets: (!image_pull_secrets.is_empty()).then_some(image_pull_secrets),
            ..Default::default()
        };
        Job {
            metadata: self.job_metadata(request),
            spec: Some(self.job_spec(request, pod_spec)),
            ..Default::default()
        }
    }

    /// Job removing the image through the node's container runtime.
    pub fn delete_job_manifest(&self, request: &ImageWorkRequest) -> Job {
        let socket = runtime_socket(&request.container_runtime_version, &request.image);
        let pod_spec = PodSpec {
            containers: vec![Container {
                name: "image-deleter".to_string(),
                image: Some(self.cri_client_image.clone()),
                command: Some(socket.command),
                volume_mounts: Some(vec![VolumeMount {
                    name: RUNTIME_SOCKET_VOLUME.to_string(),
                    mount_path: socket.path.to_string(),
                    ..Default::default()
                }]),
                image_pull_policy: Some(ImagePullPolicy::IfNotPresent.as_str().to_string()),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: RUNTIME_SOCKET_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: socket.path.to_string(),
                    type_: Some("Socket".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };
        Job {
            metadata: self.job_metadata(request),
            spec: Some(self.job_spec(request, pod_spec)),
            ..Default::default()
        }
    }

    async fn create_job(&self, job: &Job) -> Result<String, Error> {
        let created = self
            .jobs()
            .create(&PostParams::default(), job)
            .await
            .err_tip(|| format!("While creating job in {}", self.namespace))?;
        Ok(created.name_any())
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create_pull_job(&self, request: &ImageWorkRequest) -> Result<String, Error> {
        self.create_job(&self.pull_job_manifest(request)).await
    }

    async fn create_delete_job(&self, request: &ImageWorkRequest) -> Result<String, Error> {
        self.create_job(&self.delete_job_manifest(request)).await
    }

    async fn image_present_on_node(&self, request: &ImageWorkRequest) -> Result<bool, Error> {
        let node_name = request.node_name();
        let node = Api::<Node>::all(self.client.clone())
            .get(&node_name)
            .await
            .err_tip(|| format!("While fetching node {node_name}"))?;
        Ok(node_has_image(&node, &request.image))
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(&format!("{JOB_NAME_LABEL}={job_name}"));
        let pods = self
            .pods()
            .list(&params)
            .await
            .err_tip(|| format!("While listing pods of job {job_name}"))?;
        Ok(pods.items)
    }

    async fn list_failure_events(&self, pod: &Pod) -> Result<Vec<Event>, Error> {
        let namespace = pod.namespace().unwrap_or_else(|| self.namespace.clone());
        let selector = format!(
            "involvedObject.kind=Pod,involvedObject.name={},involvedObject.namespace={namespace},reason=Failed",
            pod.name_any()
        );
        let events = Api::<Event>::namespaced(self.client.clone(), &namespace)
            .list(&ListParams::default().fields(&selector))
            .await
            .err_tip(|| format!("While listing events of pod {}", pod.name_any()))?;
        Ok(events.items)
    }

    async fn delete_job(&self, job_name: &str) -> Result<(), Error> {
        match self.jobs().delete(job_name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = Error::from(err);
                if err.code == Code::NotFound {
                    debug!(job = job_name, "Job already gone");
                    return Ok(());
                }
                Err(err).err_tip(|| format!("While deleting job {job_name}"))
            }
        }
    }

    fn watch_pods(&self) -> PodEventStream {
        watcher(self.pods(), watcher::Config::default())
            .default_backoff()
            .map_err(Error::from)
            .boxed()
    }
}
