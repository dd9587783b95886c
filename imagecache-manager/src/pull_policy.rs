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

use imagecache_config::image_manager::ImagePullPolicy;
use imagecache_error::Error;

/// Tag of an image reference, ignoring any digest. Registry ports are not
/// mistaken for tags since only the last path segment is inspected.
pub fn image_tag(image: &str) -> Option<&str> {
    let without_digest = image.split_once('@').map_or(image, |(name, _)| name);
    let last_segment = without_digest
        .rsplit_once('/')
        .map_or(without_digest, |(_, segment)| segment);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}

/// Images without a tag, or tagged `latest`, may change behind the same
/// name and are pulled regardless of the pull policy.
pub fn is_floating_tag(image: &str) -> bool {
    matches!(image_tag(image), None | Some("latest"))
}

/// Decides whether `image` needs a pull job. `is_present` is only consulted
/// when the decision depends on the node's current images.
pub async fn image_needs_pull<F, Fut>(
    policy: ImagePullPolicy,
    image: &str,
    is_present: F,
) -> Result<bool, Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    match policy {
        ImagePullPolicy::Always => Ok(true),
        ImagePullPolicy::IfNotPresent if is_floating_tag(image) => Ok(true),
        ImagePullPolicy::IfNotPresent => Ok(!is_present().await?),
    }
}
