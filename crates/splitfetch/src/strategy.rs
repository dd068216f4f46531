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

use std::{
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::FanOutConfig,
    content::Batch,
    endpoint::Endpoint,
    error::{FetchError, SplitError},
    metrics,
    name::Name,
    orchestrator::SplitOrchestrator,
    topology::AggregationTree,
};

/// Issues the split requests of a session.
///
/// `begin_work` is called once when the session starts; `halt_work` once when
/// it stops. After `halt_work` returns no new split may be issued.
pub trait RetrievalStrategy: Send + Sync + 'static {
    fn begin_work(&self, session: SessionHandle) -> Result<(), SplitError>;

    fn halt_work(&self);
}

/// What a strategy gets to work with: the running orchestrator, the target,
/// the topology, and a token that is cancelled when the session stops.
#[derive(Clone)]
pub struct SessionHandle {
    orchestrator: Arc<SplitOrchestrator>,
    target:       Name,
    tree:         Arc<AggregationTree>,
    token:        CancellationToken,
}

impl SessionHandle {
    pub(crate) const fn new(
        orchestrator: Arc<SplitOrchestrator>,
        target: Name,
        tree: Arc<AggregationTree>,
        token: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            target,
            tree,
            token,
        }
    }

    #[must_use]
    pub const fn target(&self) -> &Name { &self.target }

    #[must_use]
    pub fn tree(&self) -> &AggregationTree { &self.tree }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<dyn Endpoint>] { self.orchestrator.endpoints() }

    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken { &self.token }

    #[must_use]
    pub fn is_stopping(&self) -> bool { self.orchestrator.is_stopping() }

    pub fn next_split_no(&self) -> u64 { self.orchestrator.next_split_no() }

    pub fn on_data(&self, batch: &Batch) { self.orchestrator.on_data(batch); }

    pub fn mark_split_received(&self) { self.orchestrator.mark_split_received(); }

    pub fn report_failure(&self, err: &FetchError) { self.orchestrator.report_failure(err); }

    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<SplitOrchestrator> { &self.orchestrator }
}

#[derive(Default)]
struct FanOutState {
    token: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Fetches every first-level branch concurrently, one task per branch.
///
/// Chunk `c` of branch `b` is requested as `/<b>/<target...>/<c>/seq=<split>`
/// and split numbers pick the endpoint round-robin. Transport errors are
/// retried with exponential backoff; any other failure, or running out of
/// retries, is reported to the session and ends that branch's task.
pub struct FanOutStrategy {
    config:  FanOutConfig,
    runtime: Option<Handle>,
    state:   Mutex<FanOutState>,
}

impl FanOutStrategy {
    #[must_use]
    pub fn new(config: FanOutConfig) -> Self {
        Self {
            config,
            runtime: None,
            state: Mutex::new(FanOutState::default()),
        }
    }

    /// Spawns branch tasks on `handle` instead of the caller's runtime.
    #[must_use]
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Waits for every branch task spawned so far.
    pub async fn join(&self) {
        let tasks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "branch task panicked");
                }
            }
        }
    }
}

impl RetrievalStrategy for FanOutStrategy {
    fn begin_work(&self, session: SessionHandle) -> Result<(), SplitError> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| SplitError::NoRuntime)?,
        };
        let token = session.cancellation_token().child_token();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for branch in session.tree().root_children() {
            let fetch = BranchFetch {
                session: session.clone(),
                branch:  branch.clone(),
                config:  self.config.clone(),
                token:   token.clone(),
            };
            state.tasks.push(runtime.spawn(fetch.run()));
        }
        state.token = Some(token);

        info!(
            branches = state.tasks.len(),
            endpoints = session.endpoints().len(),
            chunks_per_branch = self.config.chunks_per_branch,
            "fan-out started"
        );
        Ok(())
    }

    fn halt_work(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = state.token.take() {
            token.cancel();
            info!(tasks = state.tasks.len(), "fan-out halted");
        }
    }
}

struct BranchFetch {
    session: SessionHandle,
    branch:  String,
    config:  FanOutConfig,
    token:   CancellationToken,
}

impl BranchFetch {
    async fn run(self) {
        let depth = self.config.pipeline_depth.max(1);
        let mut results = pin!(
            futures::stream::iter(0..self.config.chunks_per_branch)
                .map(|chunk| self.fetch_chunk(chunk))
                .buffer_unordered(depth)
        );

        loop {
            let next = tokio::select! {
                () = self.token.cancelled() => break,
                next = results.next() => next,
            };
            match next {
                None | Some(Err(FetchError::Cancelled)) => break,
                Some(Ok(batch)) => {
                    self.session.mark_split_received();
                    self.session.on_data(&batch);
                }
                Some(Err(e)) => {
                    error!(branch = %self.branch, error = %e, "giving up on branch");
                    self.session.report_failure(&e);
                    break;
                }
            }
        }
        debug!(branch = %self.branch, "branch task finished");
    }

    async fn fetch_chunk(&self, chunk: u64) -> Result<Batch, FetchError> {
        if self.token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let split_no = self.session.next_split_no();
        let name = Name::new()
            .append(self.branch.as_str())
            .join(self.session.target())
            .append(chunk.to_string())
            .append_sequence(split_no);
        let endpoints = self.session.endpoints();
        let endpoint = &endpoints[usize::try_from(split_no).map_or(0, |n| n % endpoints.len())];

        metrics::SPLITS_ISSUED.inc();
        debug!(name = %name, endpoint = endpoint.name(), "issuing split");

        let backoff = ExponentialBuilder::default()
            .with_max_times(self.config.max_retries)
            .with_min_delay(self.config.min_retry_delay)
            .with_max_delay(self.config.max_retry_delay);
        let object = (|| endpoint.fetch(&name))
            .retry(backoff)
            .when(FetchError::is_retryable)
            .notify(|e: &FetchError, after: Duration| {
                metrics::FETCH_RETRIES.inc();
                warn!(name = %name, error = %e, retry_in = ?after, "retrying split");
            })
            .await?;

        Ok(Batch::from([(split_no, Arc::new(object))]))
    }
}
