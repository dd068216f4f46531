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

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever, whatever};
use splitfetch::{
    Endpoint, FanOutConfig, FanOutStrategy, FetchError, FlowConfig, MemoryEndpoint, Name,
    SessionConfig, SplitError, SplitOrchestrator, format_throughput,
};
use splitfetch_common_telemetry::{LogFormat, LoggingOptions, init_global_logging, set_panic_hook};
use splitfetch_error::ErrorExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "splitfetch",
about = "Split retrieval over an aggregation tree",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION,
long_version = build_info::LONG_VERSION)]
struct Cli {
    /// Log level filter, e.g. `info` or `debug,splitfetch=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory for rolling log files
    #[arg(long, global = true)]
    log_dir: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    commands: Commands,
}

impl Cli {
    fn logging_options(&self) -> LoggingOptions {
        LoggingOptions::builder()
            .maybe_level(self.log_level.clone())
            .dir(self.log_dir.clone().unwrap_or_default())
            .log_format(if self.json_logs {
                LogFormat::Json
            } else {
                LogFormat::Text
            })
            .build()
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Fetch(FetchArgs),
    Throughput(ThroughputArgs),
}

fn describe(err: &SplitError) -> String {
    format!("{} [{}]", err.output_msg(), err.status_code())
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Retrieves a versioned object split across the first-level branches of an
aggregation tree and writes it to the configured output file.

Chunks are served from a local directory laid out as <dir>/<branch>/<chunk>.
Examples:

splitfetch fetch --config session.toml --serve-dir ./chunks /file/v=1

")]
struct FetchArgs {
    /// Versioned name of the object, e.g. `/file/v=1`
    target: String,

    /// Session configuration (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory the in-memory endpoints are seeded from
    #[arg(long)]
    serve_dir: PathBuf,

    /// Number of endpoints serving the same content
    #[arg(long, default_value_t = 1)]
    endpoints: usize,

    /// Requests in flight per branch
    #[arg(long, default_value_t = 4)]
    pipeline_depth: usize,

    /// Retries for a failing request
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

impl FetchArgs {
    async fn run(&self) -> Result<(), Whatever> {
        let config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_whatever_context(|e| format!("loading session config: {}", describe(e)))?,
            None => SessionConfig::default(),
        };
        let flow = FlowConfig::load(&config.flow_config_path)
            .with_whatever_context(|e| format!("loading flow config: {}", describe(e)))?;

        let target = Name::from(self.target.as_str());
        if !config.disable_version_discovery && !target.last().is_some_and(|c| c.is_version()) {
            whatever!(
                "target {target} has no version component and version discovery is enabled"
            );
        }

        let mut endpoints: Vec<Arc<dyn Endpoint>> = Vec::with_capacity(self.endpoints);
        for idx in 0..self.endpoints {
            let endpoint =
                MemoryEndpoint::from_dir(format!("local-{idx}"), &self.serve_dir, &target)
                    .await
                    .with_whatever_context(|e| format!("seeding endpoint: {}", describe(e)))?;
            endpoints.push(Arc::new(endpoint));
        }

        let strategy = Arc::new(FanOutStrategy::new(
            FanOutConfig::builder()
                .chunks_per_branch(flow.chunks_per_branch)
                .pipeline_depth(self.pipeline_depth)
                .max_retries(self.max_retries)
                .build(),
        ));
        let output = config.output_path.clone();
        let orchestrator = Arc::new(
            SplitOrchestrator::new(endpoints, config, strategy.clone())
                .with_whatever_context(|e| format!("creating orchestrator: {}", describe(e)))?,
        );

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<FetchError>();
        orchestrator
            .run(
                target,
                |_| {},
                move |e| {
                    let _ = failure_tx.send(e.clone());
                },
            )
            .with_whatever_context(|e| format!("starting retrieval: {}", describe(e)))?;

        let outcome = tokio::select! {
            () = orchestrator.stopped() => Ok(()),
            Some(err) = failure_rx.recv() => Err(format!("retrieval failed: {err} [{}]", err.status_code())),
            _ = tokio::signal::ctrl_c() => Err("interrupted".to_string()),
            () = tokio::time::sleep(Duration::from_secs(self.timeout_secs)) => {
                Err(format!("timed out after {}s", self.timeout_secs))
            }
        };

        orchestrator.cancel();
        strategy.join().await;

        match outcome {
            Ok(()) => {
                info!(output = %output.display(), "retrieval complete");
                println!("{}", output.display());
                Ok(())
            }
            Err(message) => {
                warn!(received = orchestrator.received(), "{message}");
                whatever!("{message}")
            }
        }
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Formats a bit rate with a decimal unit prefix.
Examples:

splitfetch throughput 1500

")]
struct ThroughputArgs {
    /// Bits per second
    bits_per_sec: f64,
}

impl ThroughputArgs {
    fn run(&self) -> Result<(), Whatever> {
        if !self.bits_per_sec.is_finite() || self.bits_per_sec < 0.0 {
            whatever!("throughput must be a non-negative number");
        }
        println!("{}", format_throughput(self.bits_per_sec));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();
    let cli = Cli::parse();
    let _guards = init_global_logging("splitfetch", &cli.logging_options());
    set_panic_hook();

    match cli.commands {
        Commands::Fetch(fa) => fa.run().await,
        Commands::Throughput(ta) => ta.run(),
    }
}
