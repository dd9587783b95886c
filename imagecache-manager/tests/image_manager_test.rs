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

use imagecache_config::image_manager::{ImageManagerConfig, WorkQueueConfig};
use imagecache_error::{Code, Error, make_err};
use imagecache_macro::imagecache_test;
use imagecache_manager::image_manager::ImageManager;
use imagecache_manager::work_item::{
    ImageWorkItem, ImageWorkResultStatus, JobId, ReconcileRequest, WorkType,
};
use imagecache_util::spawn;
use imagecache_util::work_queue::WorkQueue;
use kube::runtime::watcher::Event;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

mod utils {
    pub(crate) mod fixtures;
    pub(crate) mod mock_job_client;
}

use utils::fixtures::{make_image_cache, make_pod, make_request};
use utils::mock_job_client::MockJobClient;

struct TestContext {
    job_client: Arc<MockJobClient>,
    image_work_queue: Arc<WorkQueue<ImageWorkItem>>,
    reconcile_queue: Arc<WorkQueue<ReconcileRequest>>,
    shutdown: CancellationToken,
    manager: Arc<ImageManager<MockJobClient>>,
}

fn setup() -> TestContext {
    let config = ImageManagerConfig {
        image_pull_deadline_s: 30,
        status_poll_interval_ms: 100,
        ..Default::default()
    };
    let job_client = Arc::new(MockJobClient::new());
    let image_work_queue = WorkQueue::new("image_work", WorkQueueConfig::default());
    let reconcile_queue = WorkQueue::new("reconcile", WorkQueueConfig::default());
    let shutdown = CancellationToken::new();
    let manager = Arc::new(ImageManager::new(
        &config,
        job_client.clone(),
        image_work_queue.clone(),
        reconcile_queue.clone(),
        shutdown.clone(),
    ));
    TestContext {
        job_client,
        image_work_queue,
        reconcile_queue,
        shutdown,
        manager,
    }
}

async fn wait_for_jobs(job_client: &MockJobClient, count: usize) {
    while job_client.created_jobs().len() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[imagecache_test(start_paused = true)]
async fn batch_is_reported_after_pods_finish() -> Result<(), Error> {
    let ctx = setup();
    let manager = ctx.manager.clone();
    let manager_task = spawn!("image_manager", async move { manager.run().await });

    ctx.job_client.send_pod_event(Event::Init);
    ctx.job_client.send_pod_event(Event::InitDone);

    let image_cache = make_image_cache("web", &["nginx:1.25", "redis:7"]);
    ctx.job_client.set_image_present("node-b", "redis:7");
    for (image, node) in [("nginx:1.25", "node-a"), ("redis:7", "node-b")] {
        ctx.image_work_queue.add(ImageWorkItem::Image(make_request(
            image,
            node,
            WorkType::Create,
            &image_cache,
        )));
    }
    ctx.image_work_queue.add(ImageWorkItem::Flush(image_cache.clone()));

    wait_for_jobs(&ctx.job_client, 1).await;
    let job_name = ctx.job_client.created_jobs()[0].name.clone();
    ctx.job_client
        .send_pod_event(Event::Apply(make_pod("puller", &job_name, "Running", "1")));
    ctx.job_client
        .send_pod_event(Event::Apply(make_pod("puller", &job_name, "Succeeded", "2")));

    let Some(ReconcileRequest::StatusUpdate(update)) = ctx.reconcile_queue.get().await else {
        panic!("Expected a status update");
    };
    assert_eq!(update.obj_key, "kube-fledged/web");
    assert_eq!(update.results.len(), 2);
    assert_eq!(
        update
            .results
            .get(&JobId::Real(job_name.clone()))
            .map(|result| result.status),
        Some(ImageWorkResultStatus::Succeeded)
    );
    assert_eq!(
        update
            .results
            .values()
            .filter(|result| result.status == ImageWorkResultStatus::AlreadyPulled)
            .count(),
        1
    );
    assert_eq!(ctx.job_client.delete_calls(), vec![job_name]);
    assert!(ctx.manager.work_status().is_empty());

    ctx.shutdown.cancel();
    manager_task.await??;
    assert!(ctx.image_work_queue.is_shutting_down());
    Ok(())
}

#[imagecache_test(start_paused = true)]
async fn flush_waits_for_previous_run_of_same_cache() -> Result<(), Error> {
    let ctx = setup();
    let manager = ctx.manager.clone();
    let manager_task = spawn!("image_manager", async move { manager.run().await });
    ctx.job_client.send_pod_event(Event::InitDone);

    let image_cache = make_image_cache("web", &["nginx:1.25"]);
    ctx.image_work_queue.add(ImageWorkItem::Image(make_request(
        "nginx:1.25",
        "node-a",
        WorkType::Create,
        &image_cache,
    )));
    ctx.image_work_queue.add(ImageWorkItem::Flush(image_cache.clone()));
    wait_for_jobs(&ctx.job_client, 1).await;

    // Second batch of the same cache while the first is still running.
    ctx.image_work_queue.add(ImageWorkItem::Image(make_request(
        "nginx:1.25",
        "node-b",
        WorkType::Create,
        &image_cache,
    )));
    ctx.image_work_queue.add(ImageWorkItem::Flush(image_cache.clone()));
    wait_for_jobs(&ctx.job_client, 2).await;

    let jobs = ctx.job_client.created_jobs();
    for (index, job) in jobs.iter().enumerate() {
        let pod_name = format!("puller-{index}");
        ctx.job_client
            .send_pod_event(Event::Apply(make_pod(&pod_name, &job.name, "Succeeded", "1")));
    }

    // The first run may take the second job along; either way each job is
    // reported exactly once.
    let mut reported = Vec::new();
    while reported.len() < 2 {
        let Some(ReconcileRequest::StatusUpdate(update)) = ctx.reconcile_queue.get().await else {
            panic!("Expected a status update");
        };
        assert!(
            update
                .results
                .values()
                .all(|result| result.status == ImageWorkResultStatus::Succeeded)
        );
        reported.extend(update.results.keys().cloned());
    }
    let mut expected: Vec<JobId> = jobs.iter().map(|job| JobId::Real(job.name.clone())).collect();
    reported.sort();
    expected.sort();
    assert_eq!(reported, expected);
    assert!(ctx.manager.work_status().is_empty());

    ctx.shutdown.cancel();
    manager_task.await??;
    Ok(())
}

#[imagecache_test(start_paused = true)]
async fn retried_work_is_reported_with_its_batch() -> Result<(), Error> {
    let ctx = setup();
    let manager = ctx.manager.clone();
    let manager_task = spawn!("image_manager", async move { manager.run().await });
    ctx.job_client.send_pod_event(Event::InitDone);

    // Both items fail their first attempt and are retried after the flush
    // was queued.
    ctx.job_client
        .fail_next_create(make_err!(Code::Unavailable, "api server unreachable"));
    ctx.job_client
        .fail_next_create(make_err!(Code::Unavailable, "api server unreachable"));
    let image_cache = make_image_cache("web", &["nginx:1.25"]);
    for node in ["node-a", "node-b"] {
        ctx.image_work_queue.add(ImageWorkItem::Image(make_request(
            "nginx:1.25",
            node,
            WorkType::Create,
            &image_cache,
        )));
    }
    ctx.image_work_queue.add(ImageWorkItem::Flush(image_cache.clone()));

    wait_for_jobs(&ctx.job_client, 2).await;
    let jobs = ctx.job_client.created_jobs();
    for (index, job) in jobs.iter().enumerate() {
        let pod_name = format!("puller-{index}");
        ctx.job_client
            .send_pod_event(Event::Apply(make_pod(&pod_name, &job.name, "Succeeded", "1")));
    }

    let Some(ReconcileRequest::StatusUpdate(update)) = ctx.reconcile_queue.get().await else {
        panic!("Expected a status update");
    };
    assert_eq!(update.results.len(), 2);
    for job in &jobs {
        assert_eq!(
            update
                .results
                .get(&JobId::Real(job.name.clone()))
                .map(|result| result.status),
            Some(ImageWorkResultStatus::Succeeded)
        );
    }
    let mut deleted = ctx.job_client.delete_calls();
    deleted.sort();
    assert_eq!(
        deleted,
        vec!["imagecache-job-1".to_string(), "imagecache-job-2".to_string()]
    );
    assert!(ctx.manager.work_status().is_empty());

    ctx.shutdown.cancel();
    manager_task.await??;
    assert!(ctx.reconcile_queue.is_empty());
    Ok(())
}

#[imagecache_test]
async fn shutdown_before_pod_sync_stops_cleanly() -> Result<(), Error> {
    let ctx = setup();
    ctx.shutdown.cancel();
    ctx.manager.run().await?;
    assert!(ctx.image_work_queue.is_shutting_down());
    assert!(ctx.job_client.created_jobs().is_empty());
    Ok(())
}
