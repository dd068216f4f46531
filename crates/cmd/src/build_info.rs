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

use shadow_rs::{formatcp, shadow};

shadow!(build);

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// Set by the release pipeline. Anything else is tagged as a dev build.
const RELEASE: bool = option_env!("SPLITFETCH_RELEASE").is_some();

const COMMIT_TAG: &str = match (build::SHORT_COMMIT.is_empty(), build::GIT_CLEAN) {
    (true, _) => "",
    (false, true) => formatcp!("+{}", build::SHORT_COMMIT),
    (false, false) => formatcp!("+{}-dirty", build::SHORT_COMMIT),
};

/// `1.2.0` for releases, `1.2.0-dev+<commit>` otherwise.
pub const FULL_VERSION: &str = if RELEASE {
    build::PKG_VERSION
} else {
    formatcp!("{}-dev{}", build::PKG_VERSION, COMMIT_TAG)
};

/// Shown by `--version`: the version plus the toolchain and target it was
/// built with.
pub const LONG_VERSION: &str = formatcp!(
    "{}\nrustc: {}\ntarget: {}\nbuilt: {}",
    FULL_VERSION,
    build::RUST_VERSION,
    build::BUILD_TARGET,
    build::BUILD_TIME
);
