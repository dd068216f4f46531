// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{any::Any, error::Error as StdError};

use serde::Serialize;
use strum::EnumProperty;

/// Coarse classification of a failure, stable across crates.
///
/// The CLI turns it into a process exit code; library callers can match on it
/// without knowing the concrete error enum.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumProperty,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    #[strum(props(exit_code = "2"))]
    InvalidArgument,
    #[strum(props(exit_code = "3"))]
    NotFound,
    #[strum(props(exit_code = "4"))]
    IllegalState,
    #[strum(props(exit_code = "5"))]
    StorageUnavailable,
    #[strum(props(exit_code = "6"))]
    Unavailable,
    #[strum(props(exit_code = "7"))]
    Cancelled,
    #[strum(props(exit_code = "1"))]
    Internal,
    #[strum(props(exit_code = "1"))]
    Unknown,
}

impl StatusCode {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        self.get_str("exit_code")
            .and_then(|value| value.parse::<i32>().ok())
            .unwrap_or(1)
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool { matches!(self, Self::Unavailable) }
}

pub trait ErrorExt: StdError {
    fn status_code(&self) -> StatusCode { StatusCode::Unknown }

    fn as_any(&self) -> &dyn Any;

    /// Message suitable for end users: internal failures are masked, others
    /// are reported together with their innermost cause.
    fn output_msg(&self) -> String
    where
        Self: Sized,
    {
        match self.status_code() {
            StatusCode::Unknown | StatusCode::Internal => {
                format!("Internal error: {}", self.status_code().exit_code())
            }
            _ => match self.root_cause() {
                Some(root) => format!("{self}: {root}"),
                None => format!("{self}"),
            },
        }
    }

    fn root_cause(&self) -> Option<&(dyn StdError + 'static)>
    where
        Self: Sized,
    {
        let mut source = self.source()?;
        while let Some(next) = source.source() {
            source = next;
        }
        Some(source)
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct Leaf;

    impl fmt::Display for Leaf {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("disk gone") }
    }

    impl StdError for Leaf {}

    #[derive(Debug)]
    struct Wrapper {
        code:   StatusCode,
        source: Leaf,
    }

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("failed to open sink")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> { Some(&self.source) }
    }

    impl ErrorExt for Wrapper {
        fn status_code(&self) -> StatusCode { self.code }

        fn as_any(&self) -> &dyn Any { self }
    }

    #[test]
    fn exit_codes_come_from_props() {
        assert_eq!(StatusCode::InvalidArgument.exit_code(), 2);
        assert_eq!(StatusCode::Cancelled.exit_code(), 7);
        assert_eq!(StatusCode::Unknown.exit_code(), 1);
    }

    #[test]
    fn output_msg_includes_root_cause() {
        let err = Wrapper {
            code:   StatusCode::StorageUnavailable,
            source: Leaf,
        };
        assert_eq!(err.output_msg(), "failed to open sink: disk gone");
    }

    #[test]
    fn output_msg_masks_internal_errors() {
        let err = Wrapper {
            code:   StatusCode::Internal,
            source: Leaf,
        };
        assert_eq!(err.output_msg(), "Internal error: 1");
    }

    #[test]
    fn status_code_parses_from_snake_case() {
        assert_eq!(
            "not_found".parse::<StatusCode>().ok(),
            Some(StatusCode::NotFound)
        );
        assert_eq!(StatusCode::IllegalState.to_string(), "illegal_state");
    }
}
