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

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::work_item::{ImageWorkResult, JobId};

#[derive(Debug)]
struct TableEntry {
    result: ImageWorkResult,
    /// Set once the job backing this entry was deleted, so a retried drain
    /// never deletes it twice.
    job_deleted: bool,
}

/// Tracks the outcome of every dispatched unit of image work until the batch
/// it belongs to is reported.
///
/// Readers never observe a partially updated entry: every mutation happens
/// under a single acquisition of the write lock, and the lock is never held
/// across an `await`.
#[derive(Debug, Default)]
pub struct WorkStatusTable {
    entries: RwLock<HashMap<JobId, TableEntry>>,
}

impl WorkStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: JobId, result: ImageWorkResult) {
        self.entries.write().insert(
            job_id,
            TableEntry {
                result,
                job_deleted: false,
            },
        );
    }

    pub fn get(&self, job_id: &JobId) -> Option<ImageWorkResult> {
        self.entries
            .read()
            .get(job_id)
            .map(|entry| entry.result.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Ids of every entry belonging to the image cache `cache_key`.
    pub fn job_ids_for(&self, cache_key: &str) -> HashSet<JobId> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.result.request.cache_key() == cache_key)
            .map(|(job_id, _)| job_id.clone())
            .collect()
    }

    /// Whether any entry of the cache `cache_key` is still waiting on its job.
    pub fn has_pending_for(&self, cache_key: &str) -> bool {
        self.entries.read().values().any(|entry| {
            entry.result.status.is_pending() && entry.result.request.cache_key() == cache_key
        })
    }

    /// Copies of the entries among `job_ids` still waiting on their job.
    pub fn pending(&self, job_ids: &HashSet<JobId>) -> Vec<(JobId, ImageWorkResult)> {
        let entries = self.entries.read();
        job_ids
            .iter()
            .filter_map(|job_id| {
                let entry = entries.get(job_id)?;
                entry
                    .result
                    .status
                    .is_pending()
                    .then(|| (job_id.clone(), entry.result.clone()))
            })
            .collect()
    }

    /// Applies `resolve` to the entry of `job_id` if it is still waiting on
    /// its job, and returns the updated result. Entries that were already
    /// resolved, or removed, are left alone.
    pub fn resolve_pending<F>(&self, job_id: &JobId, resolve: F) -> Option<ImageWorkResult>
    where
        F: FnOnce(&mut ImageWorkResult),
    {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(job_id)?;
        if !entry.result.status.is_pending() {
            return None;
        }
        resolve(&mut entry.result);
        Some(entry.result.clone())
    }

    /// Replaces, in one step, every entry of `resolutions` that is still
    /// waiting on its job. Returns how many entries were replaced.
    pub fn resolve_all_pending(&self, resolutions: Vec<(JobId, ImageWorkResult)>) -> usize {
        let mut entries = self.entries.write();
        let mut resolved = 0;
        for (job_id, result) in resolutions {
            if let Some(entry) = entries.get_mut(&job_id) {
                if entry.result.status.is_pending() {
                    entry.result = result;
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Names of the real jobs among `job_ids` that were not deleted yet.
    pub fn jobs_to_delete(&self, job_ids: &HashSet<JobId>) -> Vec<String> {
        let entries = self.entries.read();
        let mut names: Vec<String> = job_ids
            .iter()
            .filter(|job_id| job_id.is_real())
            .filter(|job_id| entries.get(*job_id).is_some_and(|entry| !entry.job_deleted))
            .map(|job_id| job_id.name().to_string())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn mark_job_deleted(&self, job_id: &JobId) {
        if let Some(entry) = self.entries.write().get_mut(job_id) {
            entry.job_deleted = true;
        }
    }

    /// Removes the entries of `job_ids` and returns them.
    pub fn snapshot_and_clear(&self, job_ids: &HashSet<JobId>) -> HashMap<JobId, ImageWorkResult> {
        let mut entries = self.entries.write();
        job_ids
            .iter()
            .filter_map(|job_id| {
                entries
                    .remove(job_id)
                    .map(|entry| (job_id.clone(), entry.result))
            })
            .collect()
    }
}
