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

use imagecache_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use kube::core::ErrorResponse;

#[test]
fn test_err_tip_appends_message_and_keeps_code() {
    let result: Result<(), Error> = Err(make_err!(Code::NotFound, "job not found"));
    let err = result.err_tip(|| "While deleting job").unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    assert_eq!(
        err.messages,
        vec!["job not found".to_string(), "While deleting job".to_string()]
    );
}

#[test]
fn test_err_tip_with_code_overrides_code() {
    let result: Result<(), Error> = Err(make_err!(Code::Internal, "boom"));
    let err = result
        .err_tip_with_code(|_| (Code::Unavailable, "retry later"))
        .unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    assert_eq!(err.message_string(), "boom : retry later");
}

#[test]
fn test_err_tip_on_none_is_internal() {
    let option: Option<u32> = None;
    let err = option.err_tip(|| "Missing value").unwrap_err();
    assert_eq!(err.code, Code::Internal);
    assert_eq!(err.messages, vec!["Missing value".to_string()]);
}

#[test]
fn test_err_tip_on_some_passes_through() {
    let option = Some(7);
    assert_eq!(option.err_tip(|| "Should not appear").unwrap(), 7);
}

#[test]
fn test_merge_separates_messages() {
    let err = make_input_err!("first").merge(make_err!(Code::Internal, "second"));
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(
        err.messages,
        vec!["first".to_string(), "---".to_string(), "second".to_string()]
    );
}

#[test]
fn test_error_if_returns_invalid_argument() {
    fn check(value: u32) -> Result<(), Error> {
        error_if!(value > 3, "value {value} too large");
        Ok(())
    }
    assert!(check(1).is_ok());
    let err = check(5).unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
    assert_eq!(err.messages, vec!["value 5 too large".to_string()]);
}

#[test]
fn test_empty_message_is_not_recorded() {
    let err: Error = Code::Cancelled.into();
    assert_eq!(err.code, Code::Cancelled);
    assert!(err.messages.is_empty());
}

#[test]
fn test_kube_api_error_maps_http_status() {
    let not_found = kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "jobs.batch \"foo\" not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    });
    let err: Error = not_found.into();
    assert_eq!(err.code, Code::NotFound);

    let conflict = kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "already exists".to_string(),
        reason: "AlreadyExists".to_string(),
        code: 409,
    });
    assert_eq!(Error::from(conflict).code, Code::AlreadyExists);
}

#[test]
fn test_http_status_mapping() {
    assert_eq!(Code::from_http_status(403), Code::PermissionDenied);
    assert_eq!(Code::from_http_status(429), Code::ResourceExhausted);
    assert_eq!(Code::from_http_status(503), Code::Unavailable);
    assert_eq!(Code::from_http_status(418), Code::Unknown);
}

#[test]
fn test_io_error_conversion() {
    let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
    assert_eq!(err.code, Code::DeadlineExceeded);
    assert_eq!(err.messages, vec!["slow".to_string()]);
}
