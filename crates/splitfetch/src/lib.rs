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

//! Split retrieval of a single versioned object over an aggregation tree.
//!
//! A [`SplitOrchestrator`] owns one retrieval session: it loads the
//! [`AggregationTree`], opens the output sink, builds a [`FlowController`]
//! and lets a [`RetrievalStrategy`] issue the per-split requests against the
//! configured [`Endpoint`]s. Every arrival goes through
//! [`SplitOrchestrator::on_data`], and the session ends once each first-level
//! branch of the tree has reported completion.

mod config;
mod content;
mod endpoint;
mod error;
mod flow;
pub mod metrics;
mod name;
mod orchestrator;
mod strategy;
mod throughput;
mod topology;

pub use config::{FanOutConfig, FlowConfig, SessionConfig};
pub use content::{Batch, ContentObject, batch_payload_len};
pub use endpoint::{Endpoint, MemoryEndpoint};
pub use error::{FetchError, FlowError, SplitError};
pub use flow::{FlowController, Intake, ReorderingFlowController};
pub use name::{Component, Name};
pub use orchestrator::{
    DataCallback, FailureCallback, FlowFactory, SessionState, SplitOrchestrator,
    parse_chunk_number,
};
pub use strategy::{FanOutStrategy, RetrievalStrategy, SessionHandle};
pub use throughput::format_throughput;
pub use topology::AggregationTree;
