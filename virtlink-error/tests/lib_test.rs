// Copyright 2024 The Virtlink Authors. All rights reserved.
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

use std::io;

use pretty_assertions::assert_eq;
use virtlink_error::{Code, Error, ResultExt, make_err, make_input_err};

#[test]
fn make_err_formats_message_test() {
    let error = make_err!(Code::NotFound, "pool '{}' not found", "p1");
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(error.messages, vec!["pool 'p1' not found".to_string()]);
}

#[test]
fn make_input_err_is_invalid_argument_test() {
    let error = make_input_err!("bad spec");
    assert_eq!(error.code, Code::InvalidArgument);
}

#[test]
fn empty_message_not_recorded_test() {
    let error = Error::new(Code::Internal, String::new());
    assert!(error.messages.is_empty());
}

#[test]
fn err_tip_appends_context_test() {
    let result: Result<(), Error> = Err(make_err!(Code::NotFound, "inner"))
        .err_tip(|| "While looking up backing");
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(
        error.messages,
        vec!["inner".to_string(), "While looking up backing".to_string()]
    );
}

#[test]
fn err_tip_with_code_overrides_code_test() {
    let result: Result<(), Error> = Err(make_err!(Code::Internal, "inner"))
        .err_tip_with_code(|_| (Code::FailedPrecondition, "pool not open"));
    assert_eq!(result.unwrap_err().code, Code::FailedPrecondition);
}

#[test]
fn option_err_tip_with_code_none_test() {
    let option: Option<i32> = None;
    let result = option.err_tip_with_code(|_| (Code::NotFound, "missing"));
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(error.messages, vec!["missing".to_string()]);
}

#[test]
fn option_err_tip_with_code_some_test() {
    let option = Some(42);
    let result = option.err_tip_with_code(|_| (Code::Unknown, "Should not appear"));
    assert_eq!(result, Ok(42));
}

#[test]
fn merge_separates_message_chains_test() {
    let error = make_err!(Code::Internal, "first").merge(make_err!(Code::NotFound, "second"));
    assert_eq!(error.code, Code::Internal);
    assert_eq!(
        error.messages,
        vec![
            "first".to_string(),
            "---".to_string(),
            "second".to_string()
        ]
    );
}

#[test]
fn io_error_kind_maps_to_code_test() {
    let error: Error = io::Error::new(io::ErrorKind::NotFound, "no such file").into();
    assert_eq!(error.code, Code::NotFound);

    let error: Error = io::Error::new(io::ErrorKind::AlreadyExists, "exists").into();
    assert_eq!(error.code, Code::AlreadyExists);
}

#[test]
fn unknown_numeric_code_falls_back_to_unknown_test() {
    assert_eq!(Code::from(9999), Code::Unknown);
    assert_eq!(Code::from(-1), Code::Unknown);
    assert_eq!(Code::from(5), Code::NotFound);
}

#[test]
fn to_std_err_round_trip_kind_test() {
    let error = make_err!(Code::DeadlineExceeded, "timed out");
    let std_err = error.to_std_err();
    assert_eq!(std_err.kind(), io::ErrorKind::TimedOut);
}
