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

use clap::Parser;
use imagecache_config::image_manager::ImageManagerConfig;
use imagecache_error::{Error, ResultExt};
use imagecache_manager::image_manager::ImageManager;
use imagecache_manager::kube_job_client::KubeJobClient;
use imagecache_manager::status_reporter::StatusReporter;
use imagecache_util::work_queue::WorkQueue;
use imagecache_util::{background_spawn, init_tracing, spawn};
use kube::Client;
use mimalloc::MiMalloc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Keeps container images cached on the nodes of a cluster.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn wait_for_shutdown_signal() -> Result<(), Error> {
    let mut terminate =
        signal(SignalKind::terminate()).err_tip(|| "Failed to listen to SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.err_tip(|| "Failed to listen to SIGINT")?;
            warn!("User terminated process via SIGINT");
        }
        _ = terminate.recv() => warn!("Process terminated via SIGTERM"),
    }
    Ok(())
}

async fn inner_main(config: ImageManagerConfig) -> Result<(), Error> {
    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    background_spawn!("shutdown_signal", async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_shutdown.cancel(),
            Err(err) => error!(?err, "Shutdown signals will not be handled"),
        }
    });

    let client = Client::try_default()
        .await
        .err_tip(|| "Could not connect to the cluster")?;
    let job_client = Arc::new(KubeJobClient::new(client.clone(), &config)?);
    let image_work_queue = WorkQueue::new("image_work", config.work_queue);
    let reconcile_queue = WorkQueue::new("image_cache", config.work_queue);
    let manager = ImageManager::new(
        &config,
        job_client,
        image_work_queue,
        reconcile_queue.clone(),
        shutdown.clone(),
    );

    let reporter = StatusReporter::new(client);
    let reporter_queue = reconcile_queue.clone();
    let reporter_shutdown = shutdown.clone();
    let reporter_task = spawn!("status_reporter", async move {
        reporter.run(reporter_queue, reporter_shutdown).await;
    });

    info!(namespace = %config.namespace, "Watching image jobs");
    manager.run().await.err_tip(|| "Image manager failed")?;
    reconcile_queue.shut_down();
    reporter_task.await?;
    info!("Successfully shut down imagecache");
    Ok(())
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;

    let args = Args::parse();
    let config = ImageManagerConfig::try_from_json5_file(&args.config_file)?;

    #[expect(clippy::disallowed_methods, reason = "starting main runtime")]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime
            .block_on(inner_main(config))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
