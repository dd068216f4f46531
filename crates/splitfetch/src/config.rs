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

use std::{path::{Path, PathBuf}, time::Duration};

use bon::Builder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use smart_default::SmartDefault;
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, SplitError};

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, SplitError> {
    let contents = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
    toml::from_str(&contents).context(ConfigParseSnafu { path })
}

/// Everything a retrieval session needs besides its endpoints and strategy.
/// Fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Accept targets whose last component is not a version marker
    #[default = false]
    #[builder(default = false)]
    pub disable_version_discovery: bool,

    /// Aggregation tree description (TOML)
    #[default(PathBuf::from("topology.toml"))]
    #[builder(default = PathBuf::from("topology.toml"), into)]
    pub topology_path: PathBuf,

    /// Where the reassembled object is written
    #[default(PathBuf::from("output.bin"))]
    #[builder(default = PathBuf::from("output.bin"), into)]
    pub output_path: PathBuf,

    /// Flow controller settings (TOML, see [`FlowConfig`])
    #[default(PathBuf::from("flow.toml"))]
    #[builder(default = PathBuf::from("flow.toml"), into)]
    pub flow_config_path: PathBuf,

    /// Node the aggregation tree is rooted at
    #[default("con0".to_string())]
    #[builder(default = "con0".to_string(), into)]
    pub root_id: String,
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SplitError> { load_toml(path.as_ref()) }
}

/// Settings of the reordering flow controller.
#[derive(Debug, Clone, PartialEq, Eq, SmartDefault, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Chunks each first-level branch delivers, numbered from zero
    #[default = 1]
    #[builder(default = 1)]
    pub chunks_per_branch: u64,

    /// Upper bound on chunks held back waiting for a gap to fill
    #[default = 4096]
    #[builder(default = 4096)]
    pub max_buffered_chunks: usize,
}

impl FlowConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SplitError> { load_toml(path.as_ref()) }
}

/// Settings of [`crate::FanOutStrategy`].
#[derive(Debug, Clone, SmartDefault, Builder)]
pub struct FanOutConfig {
    /// Chunks requested from every first-level branch
    #[default = 1]
    #[builder(default = 1)]
    pub chunks_per_branch: u64,

    /// Requests kept in flight per branch
    #[default = 4]
    #[builder(default = 4)]
    pub pipeline_depth: usize,

    /// Attempts after the first one for a failing request
    #[default = 3]
    #[builder(default = 3)]
    pub max_retries: usize,

    #[default(Duration::from_millis(100))]
    #[builder(default = Duration::from_millis(100))]
    pub min_retry_delay: Duration,

    #[default(Duration::from_secs(2))]
    #[builder(default = Duration::from_secs(2))]
    pub max_retry_delay: Duration,
}
