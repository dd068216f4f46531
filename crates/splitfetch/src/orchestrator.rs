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
    fmt,
    fs::File,
    path::Path,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use jiff::Timestamp;
use snafu::{ResultExt, ensure};
use strum_macros::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionConfig,
    content::{Batch, batch_payload_len},
    endpoint::Endpoint,
    error::{
        FetchError, InvalidConfigurationSnafu, OutputOpenSnafu, SessionAlreadyStartedSnafu,
        SessionStoppedSnafu, SplitError,
    },
    flow::{FlowController, Intake, ReorderingFlowController},
    metrics,
    name::{Component, Name},
    strategy::{RetrievalStrategy, SessionHandle},
    throughput::format_throughput,
    topology::AggregationTree,
};

/// Observer invoked with every arriving batch, before any parsing.
pub type DataCallback = Box<dyn Fn(&Batch) + Send + Sync>;

/// Invoked by the strategy when a split cannot be retrieved.
pub type FailureCallback = Box<dyn Fn(&FetchError) + Send + Sync>;

/// Builds the flow controller of a session from the flow config path, the
/// opened output sink, the topology and the root id.
pub type FlowFactory = Box<
    dyn Fn(&Path, File, &AggregationTree, &str) -> Result<Box<dyn FlowController>, SplitError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Constructed,
    Running,
    Stopping,
}

/// State that only exists while a session is alive.
struct Session {
    target:         Name,
    on_data:        DataCallback,
    on_failure:     FailureCallback,
    started_at:     Timestamp,
    tree:           Arc<AggregationTree>,
    flow:           Mutex<Box<dyn FlowController>>,
    /// Objects delivered through `on_data`.
    received:       Mutex<u64>,
    /// Splits the strategy reported as retrieved.
    received_split: AtomicU64,
    /// First-level branches that finished; capped at the root's child count.
    received_flow:  AtomicUsize,
    bytes_received: AtomicU64,
}

/// Drives one split retrieval session.
///
/// The orchestrator is single-use: [`run`](Self::run) starts the one session
/// it will ever have and [`cancel`](Self::cancel) stops it for good. Arrivals
/// may be delivered through [`on_data`](Self::on_data) from any thread.
pub struct SplitOrchestrator {
    config:          SessionConfig,
    endpoints:       Vec<Arc<dyn Endpoint>>,
    strategy:        Arc<dyn RetrievalStrategy>,
    flow_factory:    FlowFactory,
    next_split_no:   AtomicU64,
    started:         AtomicBool,
    stopping:        AtomicBool,
    summary_emitted: AtomicBool,
    token:           CancellationToken,
    session:         OnceLock<Session>,
}

impl fmt::Debug for SplitOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitOrchestrator")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints.len())
            .field("state", &self.state())
            .field("next_split_no", &self.next_split_no.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn default_flow_factory(
    config_path: &Path,
    sink: File,
    tree: &AggregationTree,
    root_id: &str,
) -> Result<Box<dyn FlowController>, SplitError> {
    let flow = ReorderingFlowController::from_tree(config_path, sink, tree, root_id)?;
    Ok(Box::new(flow))
}

/// Extracts the chunk number from the textual form of a name component.
///
/// One leading `/` or `%` is stripped before parsing.
pub fn parse_chunk_number(raw: &str) -> Result<u64, std::num::ParseIntError> {
    raw.strip_prefix(['/', '%']).unwrap_or(raw).parse()
}

impl SplitOrchestrator {
    pub fn new(
        endpoints: Vec<Arc<dyn Endpoint>>,
        config: SessionConfig,
        strategy: Arc<dyn RetrievalStrategy>,
    ) -> Result<Self, SplitError> {
        ensure!(
            !endpoints.is_empty(),
            InvalidConfigurationSnafu {
                message: "at least one endpoint must be provided".to_string(),
            }
        );

        Ok(Self {
            config,
            endpoints,
            strategy,
            flow_factory: Box::new(default_flow_factory),
            next_split_no: AtomicU64::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            summary_emitted: AtomicBool::new(false),
            token: CancellationToken::new(),
            session: OnceLock::new(),
        })
    }

    /// Replaces the flow controller used by [`run`](Self::run).
    #[must_use]
    pub fn with_flow_factory(mut self, factory: FlowFactory) -> Self {
        self.flow_factory = factory;
        self
    }

    /// Starts the retrieval of `target`.
    ///
    /// Loads the topology, opens the output sink, builds the flow controller
    /// and asks the strategy to begin issuing splits.
    ///
    /// # Panics
    ///
    /// Panics if version discovery is enabled and the last component of
    /// `target` is not a version marker.
    pub fn run(
        self: &Arc<Self>,
        target: Name,
        on_data: impl Fn(&Batch) + Send + Sync + 'static,
        on_failure: impl Fn(&FetchError) + Send + Sync + 'static,
    ) -> Result<(), SplitError> {
        assert!(
            self.config.disable_version_discovery || target.last().is_some_and(Component::is_version),
            "target {target} must end with a version component"
        );
        ensure!(!self.stopping.load(Ordering::Acquire), SessionStoppedSnafu);
        ensure!(
            !self.started.swap(true, Ordering::AcqRel),
            SessionAlreadyStartedSnafu
        );

        debug!(object = %target, "SplitOrchestrator::run() called");
        let started_at = Timestamp::now();

        let config = &self.config;
        let (tree, flow) = match self.open_sink_and_flow() {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "failed to set up split retrieval");
                self.cancel();
                return Err(e);
            }
        };
        let tree = Arc::new(tree);

        info!(
            object = %target,
            root = %config.root_id,
            branches = tree.root_child_count(),
            output = %config.output_path.display(),
            "starting split retrieval"
        );

        let session = Session {
            target: target.clone(),
            on_data: Box::new(on_data),
            on_failure: Box::new(on_failure),
            started_at,
            tree: Arc::clone(&tree),
            flow: Mutex::new(flow),
            received: Mutex::new(0),
            received_split: AtomicU64::new(0),
            received_flow: AtomicUsize::new(0),
            bytes_received: AtomicU64::new(0),
        };
        if self.session.set(session).is_err() {
            return SessionAlreadyStartedSnafu.fail();
        }

        let handle = SessionHandle::new(Arc::clone(self), target, tree, self.token.clone());
        if let Err(e) = self.strategy.begin_work(handle) {
            error!(error = %e, "retrieval strategy failed to start");
            self.cancel();
            return Err(e);
        }
        Ok(())
    }

    fn open_sink_and_flow(
        &self,
    ) -> Result<(AggregationTree, Box<dyn FlowController>), SplitError> {
        let config = &self.config;
        let tree = AggregationTree::load(&config.topology_path, &config.root_id)?;
        let sink = File::create(&config.output_path).context(OutputOpenSnafu {
            path: &config.output_path,
        })?;
        let flow = (self.flow_factory)(&config.flow_config_path, sink, &tree, &config.root_id)?;
        Ok((tree, flow))
    }

    /// Stops the session. Only the first call has an effect.
    pub fn cancel(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("stopping split retrieval");
        self.token.cancel();
        self.strategy.halt_work();
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.stopping.load(Ordering::Acquire) {
            SessionState::Stopping
        } else if self.started.load(Ordering::Acquire) {
            SessionState::Running
        } else {
            SessionState::Constructed
        }
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool { self.stopping.load(Ordering::Acquire) }

    /// True once every first-level branch of the root has completed.
    #[must_use]
    pub fn all_split_received(&self) -> bool {
        self.session.get().is_some_and(|s| {
            s.received_flow.load(Ordering::Acquire) == s.tree.root_child_count()
        })
    }

    /// Hands out the next split number; numbers are never reused.
    pub fn next_split_no(&self) -> u64 { self.next_split_no.fetch_add(1, Ordering::AcqRel) }

    /// Splits the strategy has reported as retrieved.
    #[must_use]
    pub fn received_split(&self) -> u64 {
        self.session
            .get()
            .map_or(0, |s| s.received_split.load(Ordering::Acquire))
    }

    pub fn mark_split_received(&self) {
        if let Some(session) = self.session.get() {
            session.received_split.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Objects delivered through [`on_data`](Self::on_data) so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.session.get().map_or(0, |s| {
            *s.received.lock().unwrap_or_else(PoisonError::into_inner)
        })
    }

    /// Completed first-level branches.
    #[must_use]
    pub fn received_flow(&self) -> usize {
        self.session
            .get()
            .map_or(0, |s| s.received_flow.load(Ordering::Acquire))
    }

    /// Records one completed first-level branch. Increments past the root's
    /// child count are ignored.
    pub fn received_flow_increment(&self) {
        let Some(session) = self.session.get() else {
            warn!("branch completion reported before the session started");
            return;
        };
        let cap = session.tree.root_child_count();
        let bumped = session
            .received_flow
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            });
        match bumped {
            Ok(prev) => {
                metrics::BRANCHES_COMPLETED.inc();
                debug!(completed = prev + 1, total = cap, "branch completed");
            }
            Err(_) => warn!(total = cap, "extra branch completion ignored"),
        }
    }

    /// Handles one arrival: notifies the data callback, forwards the chunk
    /// named by the first object to the flow controller and ends the session
    /// once every branch is complete.
    pub fn on_data(&self, batch: &Batch) {
        let Some(session) = self.session.get() else {
            warn!(objects = batch.len(), "arrival before the session started, ignored");
            return;
        };

        (session.on_data)(batch);

        metrics::ARRIVALS.inc();
        *session
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += batch.len() as u64;
        session
            .bytes_received
            .fetch_add(batch_payload_len(batch) as u64, Ordering::AcqRel);

        if let Some((_, first)) = batch.first_key_value() {
            self.forward(session, first.name(), batch);
        }

        if self.all_split_received() && !self.summary_emitted.swap(true, Ordering::AcqRel) {
            metrics::SESSIONS_COMPLETED.inc();
            self.print_summary();
            self.cancel();
        }
    }

    fn forward(&self, session: &Session, name: &Name, batch: &Batch) {
        if name.len() < 3 {
            warn!(name = %name, "Data name has incorrect format");
            metrics::CHUNKS_DROPPED
                .with_label_values(&[metrics::DROP_SHORT_NAME])
                .inc();
            return;
        }

        let (Some(node), Some(raw_chunk)) = (name.first(), name.get(-2)) else {
            return;
        };
        let chunk_no = match parse_chunk_number(raw_chunk.as_str()) {
            Ok(chunk_no) => chunk_no,
            Err(e) => {
                error!(chunk = %raw_chunk, error = %e, "Failed to parse chunk number");
                metrics::CHUNKS_DROPPED
                    .with_label_values(&[metrics::DROP_BAD_CHUNK_NUMBER])
                    .inc();
                return;
            }
        };

        debug!(node = %node, chunk = chunk_no, "Processing data");
        let intake = session
            .flow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_chunk(node.as_str(), chunk_no, batch);
        match intake {
            Ok(Intake::BranchComplete) => {
                metrics::CHUNKS_FORWARDED.inc();
                self.received_flow_increment();
            }
            Ok(Intake::Buffered | Intake::Duplicate) => metrics::CHUNKS_FORWARDED.inc(),
            Err(e) => {
                error!(node = %node, chunk = chunk_no, error = %e, "flow controller rejected chunk");
                metrics::CHUNKS_DROPPED
                    .with_label_values(&[metrics::DROP_FLOW_REJECTED])
                    .inc();
            }
        }
    }

    /// Passes a retrieval failure on to the session's failure callback.
    pub fn report_failure(&self, err: &FetchError) {
        if let Some(session) = self.session.get() {
            warn!(error = %err, "split retrieval failed");
            (session.on_failure)(err);
        }
    }

    /// Reports the finished session on stderr and as a structured event.
    #[allow(clippy::cast_precision_loss)]
    pub fn print_summary(&self) {
        let Some(session) = self.session.get() else {
            return;
        };
        let elapsed = Timestamp::now().duration_since(session.started_at);
        let bytes = session.bytes_received.load(Ordering::Acquire);
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            format_throughput(bytes as f64 * 8.0 / secs)
        } else {
            format_throughput(0.0)
        };

        let objects = *session.received.lock().unwrap_or_else(PoisonError::into_inner);

        eprintln!("All splits received");
        eprintln!("Time elapsed: {secs:.3} s, {bytes} bytes, goodput {throughput}");
        info!(
            object = %session.target,
            branches = session.tree.root_child_count(),
            objects,
            splits = session.received_split.load(Ordering::Acquire),
            bytes,
            elapsed_ms = elapsed.as_millis(),
            throughput = %throughput,
            "All splits received"
        );
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig { &self.config }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<dyn Endpoint>] { &self.endpoints }

    /// Cancelled when the session stops.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken { self.token.clone() }

    /// Resolves once the session is stopping.
    pub async fn stopped(&self) { self.token.cancelled().await; }
}
