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

pub mod deadline_reconciler;
pub mod dispatcher;
pub mod image_cache;
pub mod image_manager;
pub mod job_client;
pub mod kube_job_client;
pub mod pod_status_observer;
pub mod pull_policy;
pub mod status_reporter;
pub mod work_item;
pub mod work_status_table;
