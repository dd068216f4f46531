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

use std::sync::LazyLock;

use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

pub const REASON_LABEL: &str = "reason";

pub const DROP_SHORT_NAME: &str = "short_name";
pub const DROP_BAD_CHUNK_NUMBER: &str = "bad_chunk_number";
pub const DROP_FLOW_REJECTED: &str = "flow_rejected";

pub static ARRIVALS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "splitfetch_arrivals_total",
        "Batches delivered to the orchestrator"
    )
    .unwrap()
});

pub static CHUNKS_FORWARDED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "splitfetch_chunks_forwarded_total",
        "Chunks handed to the flow controller"
    )
    .unwrap()
});

pub static CHUNKS_DROPPED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "splitfetch_chunks_dropped_total",
        "Arrivals that did not reach the flow controller or were rejected by it",
        &[REASON_LABEL]
    )
    .unwrap()
});

pub static BRANCHES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "splitfetch_branches_completed_total",
        "First-level branches that finished delivering"
    )
    .unwrap()
});

pub static SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "splitfetch_sessions_completed_total",
        "Retrieval sessions that received every branch"
    )
    .unwrap()
});

pub static SPLITS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("splitfetch_splits_issued_total", "Split requests sent").unwrap()
});

pub static FETCH_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "splitfetch_fetch_retries_total",
        "Split requests retried after a transport error"
    )
    .unwrap()
});
