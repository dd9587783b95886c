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

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use imagecache_error::{Code, Error, make_err};
use imagecache_manager::job_client::{JobClient, PodEventStream};
use imagecache_manager::work_item::ImageWorkRequest;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::ResourceExt;
use kube::runtime::watcher;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Job created through the mock, in creation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedJob {
    pub name: String,
    pub image: String,
    pub node: String,
    pub delete: bool,
}

#[derive(Default)]
struct MockState {
    next_job: u32,
    created_jobs: Vec<CreatedJob>,
    create_errors: VecDeque<Error>,
    present_images: HashSet<(String, String)>,
    presence_checks: Vec<(String, String)>,
    pods: HashMap<String, Vec<Pod>>,
    list_pods_errors: HashMap<String, Error>,
    events: HashMap<String, Vec<Event>>,
    event_lookups: Vec<String>,
    delete_calls: Vec<String>,
    delete_errors: HashMap<String, Error>,
}

/// In-memory [`JobClient`] recording every call. Responses are scripted
/// through the setters below.
pub struct MockJobClient {
    state: Mutex<MockState>,
    pod_events_tx: mpsc::UnboundedSender<Result<watcher::Event<Pod>, Error>>,
    pod_events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<watcher::Event<Pod>, Error>>>>,
}

impl Default for MockJobClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobClient {
    pub fn new() -> Self {
        let (pod_events_tx, pod_events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState::default()),
            pod_events_tx,
            pod_events_rx: Mutex::new(Some(pod_events_rx)),
        }
    }

    pub fn set_image_present(&self, node: &str, image: &str) {
        self.state
            .lock()
            .present_images
            .insert((node.to_string(), image.to_string()));
    }

    /// The next job creation fails with `err`.
    pub fn fail_next_create(&self, err: Error) {
        self.state.lock().create_errors.push_back(err);
    }

    pub fn set_pods(&self, job_name: &str, pods: Vec<Pod>) {
        self.state.lock().pods.insert(job_name.to_string(), pods);
    }

    pub fn fail_list_pods(&self, job_name: &str, err: Error) {
        self.state
            .lock()
            .list_pods_errors
            .insert(job_name.to_string(), err);
    }

    pub fn set_events(&self, pod_name: &str, events: Vec<Event>) {
        self.state.lock().events.insert(pod_name.to_string(), events);
    }

    /// The next delete of `job_name` fails with `err`.
    pub fn fail_next_delete(&self, job_name: &str, err: Error) {
        self.state
            .lock()
            .delete_errors
            .insert(job_name.to_string(), err);
    }

    pub fn send_pod_event(&self, event: watcher::Event<Pod>) {
        // Receiver is only gone once the watch is dropped.
        let _ = self.pod_events_tx.send(Ok(event));
    }

    pub fn created_jobs(&self) -> Vec<CreatedJob> {
        self.state.lock().created_jobs.clone()
    }

    pub fn presence_checks(&self) -> Vec<(String, String)> {
        self.state.lock().presence_checks.clone()
    }

    pub fn event_lookups(&self) -> Vec<String> {
        self.state.lock().event_lookups.clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().delete_calls.clone()
    }

    fn create_job(&self, request: &ImageWorkRequest, delete: bool) -> Result<String, Error> {
        let mut state = self.state.lock();
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        state.next_job += 1;
        let name = format!("imagecache-job-{}", state.next_job);
        state.created_jobs.push(CreatedJob {
            name: name.clone(),
            image: request.image.clone(),
            node: request.node_name(),
            delete,
        });
        Ok(name)
    }
}

#[async_trait]
impl JobClient for MockJobClient {
    async fn create_pull_job(&self, request: &ImageWorkRequest) -> Result<String, Error> {
        self.create_job(request, false)
    }

    async fn create_delete_job(&self, request: &ImageWorkRequest) -> Result<String, Error> {
        self.create_job(request, true)
    }

    async fn image_present_on_node(&self, request: &ImageWorkRequest) -> Result<bool, Error> {
        let key = (request.node_name(), request.image.clone());
        let mut state = self.state.lock();
        state.presence_checks.push(key.clone());
        Ok(state.present_images.contains(&key))
    }

    async fn list_pods(&self, job_name: &str) -> Result<Vec<Pod>, Error> {
        let state = self.state.lock();
        if let Some(err) = state.list_pods_errors.get(job_name) {
            return Err(err.clone());
        }
        Ok(state.pods.get(job_name).cloned().unwrap_or_default())
    }

    async fn list_failure_events(&self, pod: &Pod) -> Result<Vec<Event>, Error> {
        let pod_name = pod.name_any();
        let mut state = self.state.lock();
        state.event_lookups.push(pod_name.clone());
        Ok(state.events.get(&pod_name).cloned().unwrap_or_default())
    }

    async fn delete_job(&self, job_name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.delete_calls.push(job_name.to_string());
        if let Some(err) = state.delete_errors.remove(job_name) {
            return Err(err);
        }
        Ok(())
    }

    fn watch_pods(&self) -> PodEventStream {
        let Some(rx) = self.pod_events_rx.lock().take() else {
            return futures::stream::once(async {
                Err(make_err!(Code::Internal, "Pods are already being watched"))
            })
            .boxed();
        };
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}
