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
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use imagecache_config::image_manager::WorkQueueConfig;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::background_spawn;

/// Items placed on a [`WorkQueue`] must expose a key. Retry accounting and
/// in-flight tracking are done per key, so two items with the same key are
/// treated as the same unit of work.
pub trait QueueItem: Send + 'static {
    fn queue_key(&self) -> String;
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    /// Keys handed out by `get()` and not yet marked `done()`.
    processing: HashSet<String>,
    /// Number of times each key was re-added through `add_rate_limited()`.
    failures: HashMap<String, u32>,
    /// Keys of items scheduled through `add_after()` and not yet added.
    delayed: HashMap<String, usize>,
    shutting_down: bool,
}

/// FIFO work queue with per-item exponential backoff for retries.
///
/// `get()` waits for the next item and returns `None` once the queue was
/// shut down and drained, so consumer loops terminate instead of blocking.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: String,
    config: WorkQueueConfig,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: impl Into<String>, config: WorkQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                delayed: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds an item to the back of the queue. Items added after shutdown
    /// are discarded.
    pub fn add(&self, item: T) {
        self.push(item, false);
    }

    fn push(&self, item: T, was_delayed: bool) {
        {
            let mut state = self.state.lock();
            if was_delayed {
                let key = item.queue_key();
                if let Some(count) = state.delayed.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        state.delayed.remove(&key);
                    }
                }
            }
            if state.shutting_down {
                debug!(queue = %self.name, key = %item.queue_key(), "Dropping item added after shutdown");
                return;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Adds an item once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        *self
            .state
            .lock()
            .delayed
            .entry(item.queue_key())
            .or_insert(0) += 1;
        let queue = self.clone();
        background_spawn!("work_queue_add_after", async move {
            tokio::time::sleep(delay).await;
            queue.push(item, true);
        });
    }

    /// Adds an item after the backoff delay of its key, and counts the
    /// attempt against the retry budget.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(item.queue_key()).or_insert(0);
            let delay = backoff_delay(&self.config, *failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Re-adds a failed item with backoff while it is within the retry
    /// budget. Returns `false` (and forgets the item) once the budget is
    /// spent.
    pub fn requeue_with_backoff(self: &Arc<Self>, item: T) -> bool {
        if self.num_requeues(&item) < self.config.max_retries {
            self.add_rate_limited(item);
            return true;
        }
        warn!(
            queue = %self.name,
            key = %item.queue_key(),
            max_retries = self.config.max_retries,
            "Dropping item after exhausting retries"
        );
        self.forget(&item);
        false
    }

    /// Waits for the next item. Returns `None` once the queue is shutting
    /// down and no items are left.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    state.processing.insert(item.queue_key());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the processing of an item as finished.
    pub fn done(&self, item: &T) {
        self.state.lock().processing.remove(&item.queue_key());
    }

    /// Clears the retry history of an item.
    pub fn forget(&self, item: &T) {
        self.state.lock().failures.remove(&item.queue_key());
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state
            .lock()
            .failures
            .get(&item.queue_key())
            .copied()
            .unwrap_or(0)
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.state.lock().processing.contains(&item.queue_key())
    }

    /// Whether an item whose key satisfies `matches` is queued, waiting out
    /// a delay, or being processed.
    pub fn has_outstanding(&self, matches: impl Fn(&str) -> bool) -> bool {
        let state = self.state.lock();
        state.items.iter().any(|item| matches(&item.queue_key()))
            || state.processing.iter().any(|key| matches(key))
            || state.delayed.keys().any(|key| matches(key))
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Stops accepting items and wakes every waiting consumer. Items already
    /// queued are still handed out by `get()`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

/// Delay before the retry following `failures` previous failures.
fn backoff_delay(config: &WorkQueueConfig, failures: u32) -> Duration {
    let multiplier = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    let delay_ms = config
        .base_delay_ms
        .saturating_mul(multiplier)
        .min(config.max_delay_ms);
    Duration::from_millis(delay_ms)
}
