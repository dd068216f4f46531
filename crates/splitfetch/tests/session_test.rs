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
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use splitfetch::{
    AggregationTree, Batch, Component, ContentObject, Endpoint, FanOutConfig, FanOutStrategy,
    FetchError, FlowController, FlowError, Intake, MemoryEndpoint, Name, RetrievalStrategy,
    SessionConfig, SessionHandle, SessionState, SplitError, SplitOrchestrator,
};
use splitfetch_common_telemetry::init_default_ut_logging;
use tempfile::TempDir;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    subscriber::DefaultGuard,
};
use tracing_subscriber::{
    Registry,
    layer::{Context, Layer, SubscriberExt},
};

/// Strategy that only counts lifecycle calls; tests deliver arrivals by hand.
#[derive(Default)]
struct ManualStrategy {
    begun:  AtomicUsize,
    halted: AtomicUsize,
}

impl RetrievalStrategy for ManualStrategy {
    fn begin_work(&self, _session: SessionHandle) -> Result<(), SplitError> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn halt_work(&self) { self.halted.fetch_add(1, Ordering::SeqCst); }
}

/// Layer that keeps the level and message of every event on this thread.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<(Level, String)>>>);

impl EventLog {
    fn capture() -> (Self, DefaultGuard) {
        let log = Self::default();
        let guard = tracing::subscriber::set_default(Registry::default().with(log.clone()));
        (log, guard)
    }

    fn count(&self, level: Level, message: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, m)| *l == level && m == message)
            .count()
    }

    fn count_level(&self, level: Level) -> usize {
        self.0.lock().unwrap().iter().filter(|(l, _)| *l == level).count()
    }
}

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        struct Message(String);
        impl Visit for Message {
            fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let mut message = Message(String::new());
        event.record(&mut message);
        self.0
            .lock()
            .unwrap()
            .push((*event.metadata().level(), message.0));
    }
}

type Forwarded = Arc<Mutex<Vec<(String, u64, usize)>>>;

/// Flow controller that records every chunk it is handed.
struct RecordingFlow {
    forwarded: Forwarded,
}

impl FlowController for RecordingFlow {
    fn add_chunk(
        &mut self,
        node_id: &str,
        chunk_no: u64,
        batch: &Batch,
    ) -> Result<Intake, FlowError> {
        self.forwarded
            .lock()
            .unwrap()
            .push((node_id.to_string(), chunk_no, batch.len()));
        Ok(Intake::Buffered)
    }
}

struct Fixture {
    dir:    TempDir,
    config: SessionConfig,
}

impl Fixture {
    fn new(topology: &str, chunks_per_branch: u64) -> Self {
        init_default_ut_logging();
        let dir = tempfile::tempdir().unwrap();
        let topology_path = dir.path().join("topology.toml");
        let flow_config_path = dir.path().join("flow.toml");
        std::fs::write(&topology_path, topology).unwrap();
        std::fs::write(
            &flow_config_path,
            format!("chunks_per_branch = {chunks_per_branch}\n"),
        )
        .unwrap();

        let config = SessionConfig::builder()
            .topology_path(topology_path)
            .flow_config_path(flow_config_path)
            .output_path(dir.path().join("out.bin"))
            .build();
        Self { dir, config }
    }

    fn output(&self) -> Vec<u8> { std::fs::read(self.dir.path().join("out.bin")).unwrap() }
}

const THREE_BRANCHES: &str = "[nodes]\ncon0 = [\"a\", \"b\", \"c\"]\n";

fn endpoint() -> Arc<dyn Endpoint> { Arc::new(MemoryEndpoint::new("mem")) }

fn target() -> Name { Name::from("/file/v=1") }

fn single(seq: u64, name: Name, payload: &'static str) -> Batch {
    Batch::from([(seq, Arc::new(ContentObject::new(name, payload)))])
}

fn chunk_name(node: &str, chunk: &str) -> Name {
    [node, "file", "v=1", chunk, "seq=0"]
        .into_iter()
        .map(Component::from)
        .collect()
}

fn manual_session(fixture: &Fixture) -> (Arc<SplitOrchestrator>, Arc<ManualStrategy>) {
    let strategy = Arc::new(ManualStrategy::default());
    let orchestrator = Arc::new(
        SplitOrchestrator::new(vec![endpoint()], fixture.config.clone(), strategy.clone())
            .unwrap(),
    );
    (orchestrator, strategy)
}

fn recording_session(
    fixture: &Fixture,
) -> (Arc<SplitOrchestrator>, Forwarded, Arc<AtomicUsize>) {
    let forwarded: Forwarded = Arc::default();
    let sink = Arc::clone(&forwarded);
    let orchestrator = SplitOrchestrator::new(
        vec![endpoint()],
        fixture.config.clone(),
        Arc::new(ManualStrategy::default()),
    )
    .unwrap()
    .with_flow_factory(Box::new(
        move |_: &Path,
              _: File,
              _: &AggregationTree,
              _: &str|
              -> Result<Box<dyn FlowController>, SplitError> {
            Ok(Box::new(RecordingFlow {
                forwarded: Arc::clone(&sink),
            }))
        },
    ));
    let orchestrator = Arc::new(orchestrator);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    orchestrator
        .run(
            target(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        )
        .unwrap();
    (orchestrator, forwarded, seen)
}

#[test]
fn three_branches_complete_the_session() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (events, _guard) = EventLog::capture();
    let (orchestrator, strategy) = manual_session(&fixture);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    orchestrator
        .run(
            target(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        )
        .unwrap();
    assert_eq!(orchestrator.state(), SessionState::Running);
    assert_eq!(strategy.begun.load(Ordering::SeqCst), 1);

    for (seq, (node, payload)) in [("c", "C"), ("a", "A"), ("b", "B")].into_iter().enumerate() {
        assert!(!orchestrator.all_split_received());
        orchestrator.on_data(&single(seq as u64, chunk_name(node, "0"), payload));
    }

    assert!(orchestrator.all_split_received());
    assert_eq!(orchestrator.received_flow(), 3);
    assert_eq!(orchestrator.received(), 3);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.state(), SessionState::Stopping);
    assert_eq!(strategy.halted.load(Ordering::SeqCst), 1);
    assert!(orchestrator.cancellation_token().is_cancelled());
    assert_eq!(fixture.output(), b"ABC");

    // Late arrivals neither re-trigger the summary nor un-complete the session.
    orchestrator.on_data(&single(9, chunk_name("a", "0"), "A"));
    orchestrator.received_flow_increment();
    assert!(orchestrator.all_split_received());
    assert_eq!(orchestrator.received_flow(), 3);
    assert_eq!(strategy.halted.load(Ordering::SeqCst), 1);
    assert_eq!(events.count(Level::INFO, "All splits received"), 1);
}

#[test]
fn numeric_chunk_components_are_forwarded_once() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (orchestrator, forwarded, seen) = recording_session(&fixture);

    for (seq, raw) in ["17", "/17", "%17", "0"].into_iter().enumerate() {
        orchestrator.on_data(&single(seq as u64, chunk_name("b", raw), "x"));
    }

    let forwarded = forwarded.lock().unwrap().clone();
    assert_eq!(
        forwarded,
        vec![
            ("b".to_string(), 17, 1),
            ("b".to_string(), 17, 1),
            ("b".to_string(), 17, 1),
            ("b".to_string(), 0, 1),
        ]
    );
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[test]
fn unparsable_chunk_number_is_dropped() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (orchestrator, forwarded, seen) = recording_session(&fixture);
    let (events, _guard) = EventLog::capture();

    for (seq, raw) in ["abc", "//5", "%", "seq=3"].into_iter().enumerate() {
        orchestrator.on_data(&single(seq as u64, chunk_name("a", raw), "x"));
        assert_eq!(events.count(Level::ERROR, "Failed to parse chunk number"), seq + 1);
    }
    assert_eq!(events.count_level(Level::ERROR), 4);

    assert!(forwarded.lock().unwrap().is_empty());
    assert_eq!(seen.load(Ordering::SeqCst), 4);
    assert_eq!(orchestrator.state(), SessionState::Running);
}

#[test]
fn short_names_skip_the_flow_controller() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (orchestrator, forwarded, seen) = recording_session(&fixture);

    orchestrator.on_data(&single(0, Name::from("/a/7"), "x"));

    assert!(forwarded.lock().unwrap().is_empty());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.received(), 1);
}

#[test]
fn only_the_first_object_of_a_batch_is_parsed() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (orchestrator, forwarded, _) = recording_session(&fixture);

    let mut batch = single(4, chunk_name("c", "2"), "x");
    batch.insert(9, Arc::new(ContentObject::new(chunk_name("a", "5"), "y")));
    orchestrator.on_data(&batch);
    orchestrator.on_data(&Batch::new());

    assert_eq!(
        forwarded.lock().unwrap().clone(),
        vec![("c".to_string(), 2, 2)]
    );
    assert_eq!(orchestrator.received(), 2);
}

#[test]
fn run_is_single_use() {
    let fixture = Fixture::new(THREE_BRANCHES, 1);
    let (orchestrator, strategy) = manual_session(&fixture);

    orchestrator.run(target(), |_| {}, |_| {}).unwrap();
    let err = orchestrator.run(target(), |_| {}, |_| {}).unwrap_err();
    assert!(matches!(err, SplitError::SessionAlreadyStarted));
    assert_eq!(strategy.begun.load(Ordering::SeqCst), 1);
}

#[test]
fn unversioned_target_is_allowed_when_discovery_is_disabled() {
    let mut fixture = Fixture::new(THREE_BRANCHES, 1);
    fixture.config.disable_version_discovery = true;
    let (orchestrator, _) = manual_session(&fixture);

    orchestrator.run(Name::from("/file"), |_| {}, |_| {}).unwrap();
    assert_eq!(orchestrator.state(), SessionState::Running);
}

#[test]
fn missing_topology_fails_run() {
    let mut fixture = Fixture::new(THREE_BRANCHES, 1);
    fixture.config.topology_path = PathBuf::from("/nonexistent/topology.toml");
    let (orchestrator, strategy) = manual_session(&fixture);

    let err = orchestrator.run(target(), |_| {}, |_| {}).unwrap_err();
    assert!(matches!(err, SplitError::TopologyRead { .. }));
    assert_eq!(strategy.begun.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.state(), SessionState::Stopping);
    assert!(orchestrator.cancellation_token().is_cancelled());

    let again = orchestrator.run(target(), |_| {}, |_| {}).unwrap_err();
    assert!(matches!(again, SplitError::SessionStopped));
}

#[test]
fn unknown_root_fails_run() {
    let mut fixture = Fixture::new(THREE_BRANCHES, 1);
    fixture.config.root_id = "agg9".to_string();
    let (orchestrator, _) = manual_session(&fixture);

    let err = orchestrator.run(target(), |_| {}, |_| {}).unwrap_err();
    assert!(matches!(err, SplitError::UnknownRoot { .. }));
}

#[test]
fn concurrent_arrivals_and_cancel_halt_once() {
    let topology = "[nodes]\ncon0 = [\"n0\", \"n1\", \"n2\", \"n3\", \"n4\", \"n5\", \"n6\", \"n7\"]\n";
    let fixture = Fixture::new(topology, 16);
    let (orchestrator, strategy) = manual_session(&fixture);
    orchestrator.run(target(), |_| {}, |_| {}).unwrap();

    std::thread::scope(|scope| {
        for node in 0..8 {
            let orchestrator = Arc::clone(&orchestrator);
            scope.spawn(move || {
                for chunk in (0..16).rev() {
                    let name = chunk_name(&format!("n{node}"), &chunk.to_string());
                    orchestrator.on_data(&single(orchestrator.next_split_no(), name, "z"));
                }
            });
        }
        for _ in 0..4 {
            let orchestrator = Arc::clone(&orchestrator);
            scope.spawn(move || orchestrator.cancel());
        }
    });

    assert!(orchestrator.all_split_received());
    assert_eq!(orchestrator.received(), 128);
    assert_eq!(strategy.halted.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.output().len(), 128);
}

fn seeded_endpoint(name: &str, tree: &AggregationTree, chunks: u64) -> Arc<MemoryEndpoint> {
    let endpoint = MemoryEndpoint::new(name);
    for branch in tree.root_children() {
        for chunk in 0..chunks {
            let object = Name::new()
                .append(branch.as_str())
                .join(&target())
                .append(chunk.to_string());
            endpoint.insert(object, format!("[{branch}:{chunk}]"));
        }
    }
    Arc::new(endpoint)
}

fn expected_output(tree: &AggregationTree, chunks: u64) -> Vec<u8> {
    tree.root_children()
        .iter()
        .flat_map(|branch| (0..chunks).map(move |chunk| format!("[{branch}:{chunk}]")))
        .collect::<String>()
        .into_bytes()
}

fn fan_out(chunks: u64) -> Arc<FanOutStrategy> {
    Arc::new(FanOutStrategy::new(
        FanOutConfig::builder()
            .chunks_per_branch(chunks)
            .pipeline_depth(3)
            .min_retry_delay(Duration::from_millis(1))
            .max_retry_delay(Duration::from_millis(5))
            .build(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_retrieves_every_branch() {
    let fixture = Fixture::new(THREE_BRANCHES, 5);
    let tree = AggregationTree::load(&fixture.config.topology_path, "con0").unwrap();
    let first = seeded_endpoint("first", &tree, 5);
    let second = seeded_endpoint("second", &tree, 5);
    let strategy = fan_out(5);

    let endpoints: Vec<Arc<dyn Endpoint>> = vec![first.clone(), second.clone()];
    let orchestrator = Arc::new(
        SplitOrchestrator::new(endpoints, fixture.config.clone(), strategy.clone()).unwrap(),
    );
    let arrivals = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&arrivals);
    orchestrator
        .run(
            target(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |e| panic!("unexpected failure: {e}"),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), orchestrator.stopped())
        .await
        .expect("session should complete");
    strategy.join().await;

    assert!(orchestrator.all_split_received());
    assert_eq!(arrivals.load(Ordering::SeqCst), 15);
    assert_eq!(orchestrator.received_split(), 15);
    assert_eq!(first.served() + second.served(), 15);
    assert!(first.served() > 0 && second.served() > 0);
    assert_eq!(fixture.output(), expected_output(&tree, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fan_out_retries_transport_errors() {
    let fixture = Fixture::new(THREE_BRANCHES, 2);
    let tree = AggregationTree::load(&fixture.config.topology_path, "con0").unwrap();
    let endpoint = seeded_endpoint("flaky", &tree, 2);
    endpoint.fail_next(2);
    let strategy = fan_out(2);

    let orchestrator = Arc::new(
        SplitOrchestrator::new(vec![endpoint], fixture.config.clone(), strategy.clone()).unwrap(),
    );
    orchestrator
        .run(target(), |_| {}, |e| panic!("unexpected failure: {e}"))
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), orchestrator.stopped())
        .await
        .expect("session should complete despite transport errors");
    strategy.join().await;
    assert_eq!(fixture.output(), expected_output(&tree, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fan_out_reports_missing_chunks() {
    let fixture = Fixture::new(THREE_BRANCHES, 3);
    let tree = AggregationTree::load(&fixture.config.topology_path, "con0").unwrap();
    // Only two chunks per branch are published, the third is never found.
    let endpoint = seeded_endpoint("partial", &tree, 2);
    let strategy = fan_out(3);

    let orchestrator = Arc::new(
        SplitOrchestrator::new(vec![endpoint], fixture.config.clone(), strategy.clone()).unwrap(),
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    orchestrator
        .run(
            target(),
            |_| {},
            move |e: &FetchError| {
                let _ = tx.send(e.clone());
            },
        )
        .unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("a failure should be reported")
        .unwrap();
    assert!(matches!(failure, FetchError::NotFound { .. }));
    assert!(!orchestrator.all_split_received());

    orchestrator.cancel();
    strategy.join().await;
    assert_eq!(orchestrator.state(), SessionState::Stopping);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_splits_are_issued_after_cancel() {
    let fixture = Fixture::new(THREE_BRANCHES, 50);
    let tree = AggregationTree::load(&fixture.config.topology_path, "con0").unwrap();
    let endpoint = seeded_endpoint("mem", &tree, 50);
    let strategy = fan_out(50);

    let orchestrator = Arc::new(
        SplitOrchestrator::new(vec![endpoint.clone()], fixture.config.clone(), strategy.clone())
            .unwrap(),
    );
    orchestrator.run(target(), |_| {}, |_| {}).unwrap();
    orchestrator.cancel();
    strategy.join().await;

    let issued = orchestrator.next_split_no();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.next_split_no(), issued + 1);
    assert!(endpoint.served() <= 150);
}
