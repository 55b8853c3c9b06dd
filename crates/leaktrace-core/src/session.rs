use crate::error::ConfigError;
use crate::filter::{Filter, FilterError, validate_filters};
use crate::source::{AccessSource, RunParams, SourceError, TargetSpec};
use crate::trace::{FilterLayout, Samples, TraceInput, TraceStore};
use crate::util::{NamedProgress, Rng};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Orchestrates repeated executions of a target and collects their leakage.
///
/// A `TraceSession` combines an [`AccessSource`], a [`TargetSpec`] and a set of [`Filter`]s.
/// Every run:
///
/// 1. derives a fresh input from the session seed and the run request ordinal,
/// 2. starts one execution through the source,
/// 3. fans every access event out to every filter,
/// 4. captures the output of the target and appends the completed trace to the store.
///
/// Failed runs are retried or abandoned without aborting the collection.
///
/// Use [`TraceSession::builder()`] to construct a session.
pub struct TraceSession {
    source: Box<dyn AccessSource>,
    target: TargetSpec,
    filters: Vec<Filter>,
    progress: Option<MultiProgress>,
    config: SessionConfig,
}

/// Key supplied to the target in every run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// The target takes no key
    #[default]
    None,
    /// The same key in every run
    Fixed(#[serde(with = "hex::serde")] Vec<u8>),
    /// A fresh random key of the given length in every run
    Random(usize),
}

/// Configuration parameters for trace sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Number of times a failed run is retried with the same input
    pub retries: u32,
    /// Timeout of a single execution (None = unlimited)
    pub run_timeout: Option<Duration>,
    /// Seed of the input generator (None = random, recorded in the report)
    pub seed: Option<u64>,
    /// Length of the random plaintext in bytes
    pub block_size: usize,
    /// Key policy
    pub key: KeyPolicy,
    /// Number of executions running concurrently
    pub workers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: 0,
            run_timeout: Some(Duration::from_secs(60)),
            seed: None,
            block_size: 16,
            key: KeyPolicy::None,
            workers: 1,
        }
    }
}

/// Reason a single attempt failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RunError {
    /// The execution failed
    #[error(transparent)]
    Source(#[from] SourceError),
    /// A leakage value did not fit its pack format
    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl RunError {
    /// Returns `true` if retrying the same input may succeed.
    ///
    /// Pack errors stem from the filter configuration and fail again on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Source(e) => e.is_transient(),
            RunError::Filter(_) => false,
        }
    }

    /// Name of the filter that aborted the run, if any.
    pub fn filter(&self) -> Option<&str> {
        match self {
            RunError::Source(_) => None,
            RunError::Filter(e) => Some(&e.filter),
        }
    }
}

/// A run request that was abandoned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    /// Request ordinal of the run
    pub request: u64,
    /// Number of attempts made
    pub attempts: u32,
    /// Error of the last attempt
    pub error: String,
    /// Filter that aborted the run, for pack errors
    pub filter: Option<String>,
}

/// Summary of a trace collection.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// RFC 3339 timestamp of when the collection finished
    pub date: String,
    /// Seed of the input generator
    pub seed: u64,
    /// Number of requested runs
    pub requested: u64,
    /// Number of traces in the store
    pub collected: usize,
    /// Number of abandoned runs
    pub failed: usize,
    /// Number of retries across all runs
    pub retried: u64,
    /// Abandoned runs in request order
    pub failures: Vec<RunFailure>,
}

impl RunReport {
    /// Names of the filters that aborted at least one run.
    pub fn aborted_filters(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| f.filter.as_deref())
            .unique()
            .collect()
    }
}

/// Result of [`TraceSession::run`].
#[derive(Clone, Debug)]
pub struct Collection {
    /// Collected traces
    pub store: TraceStore,
    /// Collection summary
    pub report: RunReport,
}

struct Completed {
    input: TraceInput,
    output: Vec<u8>,
    leakage: Vec<Samples>,
}

struct Outcome {
    request: u64,
    attempts: u32,
    result: Result<Completed, RunError>,
}

impl TraceSession {
    /// Creates a new session builder.
    pub fn builder() -> TraceSessionBuilder {
        TraceSessionBuilder::default()
    }

    /// Registered filters in declaration order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Target of the session.
    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Input of run request `request` for a session seeded with `seed`.
    pub fn input_for(&self, seed: u64, request: u64) -> TraceInput {
        let mut rng = Rng::for_request(seed, request);
        let plaintext = rng.bytes(self.config.block_size);
        let key = match &self.config.key {
            KeyPolicy::None => None,
            KeyPolicy::Fixed(key) => Some(key.clone()),
            KeyPolicy::Random(len) => Some(rng.bytes(*len)),
        };
        TraceInput { plaintext, key }
    }

    /// Collects `runs` traces.
    ///
    /// Failed runs are logged and excluded from the store; see [`RunReport`] for the
    /// bookkeeping. Trace indices are dense and follow request order among the successful
    /// runs, independently of the number of workers.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfig`] if `runs` is zero
    /// * [`Error::WorkerPanicked`] if a collection worker panicked
    pub fn run(&self, runs: u64) -> Result<Collection, Error> {
        if runs == 0 {
            return Err(Error::InvalidConfig("At least one run must be requested".into()));
        }
        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!(
            "Starting trace collection of {} runs on {} with {} worker(s), seed {:#x}",
            runs,
            self.target.path.display(),
            self.config.workers,
            seed
        );
        let bar = self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(runs));
            bar.set_style(ProgressStyle::named_bar("Trace collection"));
            bar
        });

        let outcomes = if self.config.workers > 1 && runs > 1 {
            self.collect_parallel(runs, seed, bar.as_ref())?
        } else {
            (0..runs)
                .map(|request| {
                    let outcome = self.collect_one(request, seed);
                    if let Some(bar) = &bar {
                        bar.inc(1);
                    }
                    outcome
                })
                .collect()
        };
        if let Some(bar) = &bar {
            bar.finish();
        }

        let mut store = TraceStore::new(self.filters.iter().map(FilterLayout::from).collect());
        let mut failures = vec![];
        let mut retried = 0;
        for outcome in outcomes {
            retried += u64::from(outcome.attempts - 1);
            match outcome.result {
                Ok(run) => {
                    store.push(run.input, run.output, run.leakage);
                }
                Err(e) => failures.push(RunFailure {
                    request: outcome.request,
                    attempts: outcome.attempts,
                    filter: e.filter().map(str::to_string),
                    error: e.to_string(),
                }),
            }
        }
        let report = RunReport {
            date: chrono::Local::now().to_rfc3339(),
            seed,
            requested: runs,
            collected: store.len(),
            failed: failures.len(),
            retried,
            failures,
        };
        info!(
            "Collected {}/{} traces ({} failed, {} retries)",
            report.collected, report.requested, report.failed, report.retried
        );
        Ok(Collection { store, report })
    }

    fn collect_parallel(
        &self,
        runs: u64,
        seed: u64,
        bar: Option<&ProgressBar>,
    ) -> Result<Vec<Outcome>, Error> {
        let next = AtomicU64::new(0);
        let outcomes = Mutex::new(Vec::with_capacity(runs as usize));
        let workers = self.config.workers.min(runs as usize);
        let joined = thread::scope(|s| {
            let handles = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        loop {
                            let request = next.fetch_add(1, Ordering::Relaxed);
                            if request >= runs {
                                break;
                            }
                            let outcome = self.collect_one(request, seed);
                            if let Some(bar) = bar {
                                bar.inc(1);
                            }
                            outcomes
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(outcome);
                        }
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join())
                .collect::<Result<Vec<_>, _>>()
        });
        if joined.is_err() {
            return Err(Error::WorkerPanicked);
        }
        let mut outcomes = outcomes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        outcomes.sort_by_key(|o| o.request);
        Ok(outcomes)
    }

    fn collect_one(&self, request: u64, seed: u64) -> Outcome {
        let input = self.input_for(seed, request);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(request, &input) {
                Ok((output, leakage)) => {
                    return Outcome {
                        request,
                        attempts,
                        result: Ok(Completed {
                            input,
                            output,
                            leakage,
                        }),
                    };
                }
                Err(e) if e.is_retryable() && attempts <= self.config.retries => {
                    warn!("Run {} failed on attempt {}: {}. Retrying", request, attempts, e);
                }
                Err(e) => {
                    warn!(
                        "Run {} abandoned after {} attempt(s): {}",
                        request, attempts, e
                    );
                    return Outcome {
                        request,
                        attempts,
                        result: Err(e),
                    };
                }
            }
        }
    }

    fn attempt(
        &self,
        request: u64,
        input: &TraceInput,
    ) -> Result<(Vec<u8>, Vec<Samples>), RunError> {
        let params = RunParams {
            run: request,
            target: &self.target,
            input,
            timeout: self.config.run_timeout,
        };
        let mut stream = self.source.start(&params)?;
        let mut leakage = vec![Samples::default(); self.filters.len()];
        let mut events = 0usize;
        for event in stream.by_ref() {
            let event = event?;
            events += 1;
            for (filter, samples) in self.filters.iter().zip(leakage.iter_mut()) {
                filter.sample(&event, samples)?;
            }
        }
        let output = stream.finish()?;
        debug!(
            "Run {}: {} events, samples {:?}, output {}",
            request,
            events,
            leakage.iter().map(Samples::count).collect::<Vec<_>>(),
            hex::encode(&output)
        );
        Ok((output, leakage))
    }
}

/// Builder for [`TraceSession`].
#[derive(Default)]
pub struct TraceSessionBuilder {
    source: Option<Box<dyn AccessSource>>,
    target: Option<TargetSpec>,
    filters: Vec<Filter>,
    progress: Option<MultiProgress>,
    config: SessionConfig,
}

impl TraceSessionBuilder {
    pub fn source<S: AccessSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn target(mut self, target: TargetSpec) -> Self {
        self.target = Some(target);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TraceSession, Error> {
        if self.filters.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one filter must be registered".into(),
            ));
        }
        validate_filters(&self.filters)?;
        if self.config.workers == 0 {
            return Err(Error::InvalidConfig("Workers must be at least 1".into()));
        }
        if self.config.block_size == 0 {
            return Err(Error::InvalidConfig("Block size must be at least 1".into()));
        }
        Ok(TraceSession {
            source: self.source.ok_or(Error::MissingSource)?,
            target: self.target.ok_or(Error::MissingTarget)?,
            filters: self.filters,
            progress: self.progress,
            config: self.config,
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("No access source specified")]
    MissingSource,
    #[error("No target specified")]
    MissingTarget,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("A collection worker panicked")]
    WorkerPanicked,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::event::{AccessEvent, AccessKind, StackRange};
    use crate::filter::presets;
    use crate::source::EventStream;
    use std::sync::atomic::AtomicU32;

    /// Writes the first plaintext byte, fails the first `flaky` launches.
    struct EchoSource {
        flaky: u32,
        launches: AtomicU32,
    }

    struct Replay {
        events: std::vec::IntoIter<AccessEvent>,
        output: Vec<u8>,
    }

    impl Iterator for Replay {
        type Item = Result<AccessEvent, SourceError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.events.next().map(Ok)
        }
    }

    impl EventStream for Replay {
        fn finish(self: Box<Self>) -> Result<Vec<u8>, SourceError> {
            Ok(self.output)
        }
    }

    impl AccessSource for EchoSource {
        fn start<'a>(
            &'a self,
            params: &RunParams<'_>,
        ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst);
            if launch < self.flaky {
                return Err(SourceError::TargetCrash("segfault".into()));
            }
            let event = AccessEvent {
                kind: AccessKind::Write,
                pc: 0x1000,
                address: 0x2000,
                size: 1,
                data: u128::from(params.input.plaintext[0]),
                stack: StackRange::EMPTY,
            };
            Ok(Box::new(Replay {
                events: vec![event].into_iter(),
                output: params.input.plaintext.clone(),
            }))
        }
    }

    fn echo(flaky: u32) -> EchoSource {
        EchoSource {
            flaky,
            launches: AtomicU32::new(0),
        }
    }

    fn target() -> TargetSpec {
        TargetSpec::new("/bin/true", Arch::Amd64, "0x1000-0x1fff".parse().unwrap())
    }

    fn config(seed: u64) -> SessionConfig {
        SessionConfig {
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_requires_components() {
        let filter = presets::by_name("data_W").unwrap();
        let err = TraceSession::builder()
            .target(target())
            .filter(filter.clone())
            .build()
            .err();
        assert!(matches!(err, Some(Error::MissingSource)));
        let err = TraceSession::builder()
            .source(echo(0))
            .filter(filter)
            .build()
            .err();
        assert!(matches!(err, Some(Error::MissingTarget)));
    }

    #[test]
    fn test_build_rejects_duplicate_filters() {
        let filter = presets::by_name("data_W").unwrap();
        let err = TraceSession::builder()
            .source(echo(0))
            .target(target())
            .filters([filter.clone(), filter])
            .build()
            .err();
        assert!(matches!(
            err,
            Some(Error::Config(ConfigError::DuplicateFilter(name))) if name == "data_W"
        ));
    }

    #[test]
    fn test_inputs_follow_key_policy() -> anyhow::Result<()> {
        let session = TraceSession::builder()
            .source(echo(0))
            .target(target())
            .filter(presets::by_name("data_W")?)
            .config(SessionConfig {
                key: KeyPolicy::Fixed(vec![0xaa; 16]),
                ..config(7)
            })
            .build()?;
        let a = session.input_for(7, 1);
        assert_eq!(a, session.input_for(7, 1));
        assert_eq!(a.plaintext.len(), 16);
        assert_eq!(a.key, Some(vec![0xaa; 16]));
        assert_ne!(a.plaintext, session.input_for(7, 2).plaintext);
        Ok(())
    }

    #[test]
    fn test_retry_bookkeeping() -> anyhow::Result<()> {
        let session = TraceSession::builder()
            .source(echo(2))
            .target(target())
            .filter(presets::by_name("data_W")?)
            .config(SessionConfig {
                retries: 2,
                ..config(1)
            })
            .build()?;
        let Collection { store, report } = session.run(3)?;
        assert_eq!(store.len(), 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.retried, 2);
        Ok(())
    }

    #[test]
    fn test_exhausted_retries_abandon_run() -> anyhow::Result<()> {
        let session = TraceSession::builder()
            .source(echo(2))
            .target(target())
            .filter(presets::by_name("data_W")?)
            .config(SessionConfig {
                retries: 1,
                ..config(1)
            })
            .build()?;
        let Collection { store, report } = session.run(2)?;
        assert_eq!(store.len(), 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].request, 0);
        assert_eq!(report.failures[0].attempts, 2);
        assert_eq!(report.failures[0].filter, None);
        Ok(())
    }

    #[test]
    fn test_samples_match_inputs() -> anyhow::Result<()> {
        let session = TraceSession::builder()
            .source(echo(0))
            .target(target())
            .filter(presets::by_name("data_W")?)
            .config(config(3))
            .build()?;
        let collection = session.run(4)?;
        for trace in &collection.store {
            assert_eq!(trace.output(), trace.input().plaintext.as_slice());
            assert_eq!(trace.leakage()[0].bytes(), &trace.input().plaintext[..1]);
        }
        assert_eq!(collection.report.seed, 3);
        Ok(())
    }

    #[test]
    fn test_zero_runs_rejected() -> anyhow::Result<()> {
        let session = TraceSession::builder()
            .source(echo(0))
            .target(target())
            .filter(presets::by_name("data_W")?)
            .build()?;
        assert!(matches!(session.run(0), Err(Error::InvalidConfig(_))));
        Ok(())
    }
}
