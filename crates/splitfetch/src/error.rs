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

use std::{any::Any, path::PathBuf};

use snafu::Snafu;
use splitfetch_error::{ErrorExt, StatusCode};

/// Errors raised while setting up or driving a retrieval session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SplitError {
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfiguration { message: String },

    #[snafu(display("Retrieval session already started on this orchestrator"))]
    SessionAlreadyStarted,

    #[snafu(display("Orchestrator was cancelled before its session started"))]
    SessionStopped,

    #[snafu(display("Failed to read config file {}: {source}", path.display()))]
    ConfigRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config file {}: {source}", path.display()))]
    ConfigParse {
        path:   PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Failed to read topology file {}: {source}", path.display()))]
    TopologyRead {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse topology file {}: {source}", path.display()))]
    TopologyParse {
        path:   PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("Invalid topology: {message}"))]
    InvalidTopology { message: String },

    #[snafu(display("Root node {root} not found in topology"))]
    UnknownRoot { root: String },

    #[snafu(display("Failed to open output sink {}: {source}", path.display()))]
    OutputOpen {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to seed endpoint from {}: {source}", path.display()))]
    EndpointSeed {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("No tokio runtime available to run the retrieval strategy"))]
    NoRuntime,
}

/// Errors reported by a [`crate::FlowController`] for a single chunk.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FlowError {
    #[snafu(display("Node {node} is not below any branch of the root"))]
    UnknownNode { node: String },

    #[snafu(display("Chunk {chunk} from node {node} is beyond the branch size {limit}"))]
    ChunkOutOfRange { node: String, chunk: u64, limit: u64 },

    #[snafu(display("Reorder buffer is full ({limit} chunks)"))]
    BufferFull { limit: usize },

    #[snafu(display("Failed to write to output sink: {source}"))]
    SinkWrite { source: std::io::Error },
}

/// Errors returned by an [`crate::Endpoint`].
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    #[snafu(display("No content for {name}"))]
    NotFound { name: String },

    #[snafu(display("Transport error on endpoint {endpoint}: {message}"))]
    Transport { endpoint: String, message: String },

    #[snafu(display("Request cancelled"))]
    Cancelled,
}

impl FetchError {
    /// Only transport hiccups are worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool { matches!(self, Self::Transport { .. }) }
}

impl ErrorExt for SplitError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidConfiguration { .. }
            | Self::ConfigParse { .. }
            | Self::TopologyParse { .. }
            | Self::InvalidTopology { .. } => StatusCode::InvalidArgument,
            Self::UnknownRoot { .. } => StatusCode::NotFound,
            Self::SessionAlreadyStarted | Self::SessionStopped => StatusCode::IllegalState,
            Self::ConfigRead { .. }
            | Self::TopologyRead { .. }
            | Self::OutputOpen { .. }
            | Self::EndpointSeed { .. } => StatusCode::StorageUnavailable,
            Self::NoRuntime => StatusCode::Internal,
        }
    }

    fn as_any(&self) -> &dyn Any { self }
}

impl ErrorExt for FlowError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownNode { .. } | Self::ChunkOutOfRange { .. } => StatusCode::InvalidArgument,
            Self::BufferFull { .. } => StatusCode::Unavailable,
            Self::SinkWrite { .. } => StatusCode::StorageUnavailable,
        }
    }

    fn as_any(&self) -> &dyn Any { self }
}

impl ErrorExt for FetchError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::Transport { .. } => StatusCode::Unavailable,
            Self::Cancelled => StatusCode::Cancelled,
        }
    }

    fn as_any(&self) -> &dyn Any { self }
}
