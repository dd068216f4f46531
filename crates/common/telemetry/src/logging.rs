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

//! Process-wide `tracing` setup.
//!
//! Logs go to stdout and, when a directory is configured, to two hourly
//! rolling files: one with everything that passes the filter and one with
//! `ERROR` events only. The level filter can be swapped at runtime through
//! [`RELOAD_HANDLE`].

use std::{
    env,
    io::IsTerminal,
    sync::{Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, layer::SubscriberExt, registry::LookupSpan,
};

pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

pub const DEFAULT_LOGGING_DIR: &str = "logs";

const DEFAULT_LOG_TARGETS: &str = "info";

pub static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rolling log files. Empty means stdout only.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Level filter such as `"info"` or `"info,splitfetch::flow=debug"`.
    /// Falls back to `RUST_LOG`, then to `info`.
    pub level: Option<String>,

    /// Output format for every layer.
    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log kind (default: 720, a month of hourly files).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Also write to stdout when file logging is on.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    Json,
    /// Human-readable lines.
    #[default]
    Text,
}

#[must_use]
pub fn init_tracing_subscriber(app_name: &str) -> Vec<WorkerGuard> {
    init_global_logging(app_name, &LoggingOptions::default())
}

static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

/// Logging for tests: debug level into `UNITTEST_LOG_DIR`
/// (`/tmp/__splitfetch_unittest_logs` by default). Safe to call from every
/// test.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir = env::var("UNITTEST_LOG_DIR")
            .unwrap_or_else(|_| "/tmp/__splitfetch_unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL")
            .unwrap_or_else(|_| "debug,tokio=info,backon=info".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };
        let guards = init_global_logging("unittest", &opts);
        if let Ok(mut slot) = GLOBAL_UT_LOG_GUARD.lock() {
            *slot = Some(guards);
        }

        tracing::info!("logs dir = {}", dir);
    });
}

fn fmt_layer<S>(
    writer: NonBlocking,
    format: LogFormat,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::Layer::new()
            .json()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .boxed(),
    }
}

fn rolling_writer(
    dir: &str,
    prefix: &str,
    max_log_files: usize,
    guards: &mut Vec<WorkerGuard>,
) -> NonBlocking {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(max_log_files)
        .build(dir)
        .unwrap_or_else(|e| panic!("initializing rolling file appender at {dir} failed: {e}"));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);
    writer
}

/// Installs the global subscriber. Only the first call has an effect; the
/// returned guards must be kept alive for buffered lines to be flushed.
///
/// # Panics
///
/// Panics if the log directory cannot be used, the level string is invalid,
/// or another global subscriber was installed outside this function.
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let stdout_layer = opts.append_stdout.then(|| {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            fmt_layer(writer, opts.log_format, std::io::stdout().is_terminal())
        });

        let (file_layer, err_file_layer) = if opts.dir.is_empty() {
            (None, None)
        } else {
            let all = rolling_writer(&opts.dir, app_name, opts.max_log_files, &mut guards);
            let err = rolling_writer(
                &opts.dir,
                &format!("{app_name}-err"),
                opts.max_log_files,
                &mut guards,
            );
            (
                Some(fmt_layer(all, opts.log_format, false)),
                Some(
                    fmt_layer(err, opts.log_format, false)
                        .with_filter(filter::LevelFilter::ERROR)
                        .boxed(),
                ),
            )
        };

        let targets = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");

        let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(targets);

        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(stdout_layer)
            .with(file_layer)
            .with(err_file_layer);

        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");
    });

    guards
}
