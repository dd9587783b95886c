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

use std::sync::Arc;

use imagecache_config::image_manager::ImageManagerConfig;
use imagecache_error::{Code, Error, make_err};
use imagecache_util::spawn;
use imagecache_util::work_queue::WorkQueue;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::deadline_reconciler::DeadlineReconciler;
use crate::dispatcher::ImageWorkDispatcher;
use crate::job_client::JobClient;
use crate::pod_status_observer::PodStatusObserver;
use crate::work_item::{ImageWorkItem, ReconcileRequest};
use crate::work_status_table::WorkStatusTable;

/// Wires the dispatcher, the pod status observer and the deadline reconciler
/// around a shared [`WorkStatusTable`].
#[derive(Debug)]
pub struct ImageManager<J: JobClient> {
    job_client: Arc<J>,
    table: Arc<WorkStatusTable>,
    image_work_queue: Arc<WorkQueue<ImageWorkItem>>,
    dispatcher: Arc<ImageWorkDispatcher<J>>,
    observer: Arc<PodStatusObserver>,
    shutdown: CancellationToken,
}

impl<J: JobClient> ImageManager<J> {
    pub fn new(
        config: &ImageManagerConfig,
        job_client: Arc<J>,
        image_work_queue: Arc<WorkQueue<ImageWorkItem>>,
        reconcile_queue: Arc<WorkQueue<ReconcileRequest>>,
        shutdown: CancellationToken,
    ) -> Self {
        let table = Arc::new(WorkStatusTable::new());
        let reconciler = Arc::new(DeadlineReconciler::new(
            job_client.clone(),
            table.clone(),
            reconcile_queue,
            config.image_pull_deadline(),
            config.status_poll_interval(),
            shutdown.clone(),
        ));
        let dispatcher = Arc::new(ImageWorkDispatcher::new(
            job_client.clone(),
            table.clone(),
            image_work_queue.clone(),
            reconciler,
            config.image_pull_policy,
            config.status_poll_interval(),
            shutdown.clone(),
        ));
        let observer = Arc::new(PodStatusObserver::new(table.clone()));
        Self {
            job_client,
            table,
            image_work_queue,
            dispatcher,
            observer,
            shutdown,
        }
    }

    pub const fn work_status(&self) -> &Arc<WorkStatusTable> {
        &self.table
    }

    pub const fn image_work_queue(&self) -> &Arc<WorkQueue<ImageWorkItem>> {
        &self.image_work_queue
    }

    /// Starts watching pods, waits for the initial pod listing, then
    /// processes image work until shutdown is requested.
    pub async fn run(&self) -> Result<(), Error> {
        info!("Starting image manager");
        let (synced_tx, synced_rx) = oneshot::channel();
        let observer = self.observer.clone();
        let events = self.job_client.watch_pods();
        let shutdown = self.shutdown.clone();
        let observer_task = spawn!("pod_status_observer", async move {
            observer.run(events, shutdown, Some(synced_tx)).await;
        });

        info!("Waiting for pod watch to sync");
        tokio::select! {
            () = self.shutdown.cancelled() => {
                self.image_work_queue.shut_down();
                return Ok(());
            }
            synced = synced_rx => {
                if synced.is_err() {
                    return Err(make_err!(Code::Unavailable, "Pod watch ended before syncing"));
                }
            }
        }

        let dispatcher = self.dispatcher.clone();
        let dispatcher_task = spawn!("image_work_dispatcher", async move {
            dispatcher.run().await;
        });
        info!("Started image manager");

        self.shutdown.cancelled().await;
        info!("Shutting down image manager");
        self.image_work_queue.shut_down();
        dispatcher_task.await?;
        observer_task.await?;
        info!("Image manager stopped");
        Ok(())
    }
}
