//! Access event sources.
//!
//! An access event source wraps a dynamic instrumentation engine: it executes the target
//! binary once per call to [`AccessSource::start`] and hands out the memory accesses of that
//! execution as an [`EventStream`]. Implementations live in their own crates
//! (`leaktrace-tracergrind` drives Valgrind, `leaktrace-scripted` replays synthetic
//! executions for tests).

use crate::arch::Arch;
use crate::event::{AccessEvent, AddressRange, StackRange};
use crate::trace::TraceInput;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while executing the target.
///
/// All of them are specific to one run: the trace session logs them, retries or abandons
/// the run and continues with the next one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The target binary is missing, not executable or built for another architecture.
    #[error("Failed to launch target: {0}")]
    Launch(String),
    /// The instrumentation engine failed to attach, trace or detach.
    #[error("Instrumentation failed: {0}")]
    Instrumentation(String),
    /// The target died before emitting a well-formed output.
    #[error("Target crashed: {0}")]
    TargetCrash(String),
    /// The target exceeded the per-run timeout and was killed.
    #[error("Target timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    /// Returns `true` if the target itself died (crash or timeout).
    pub fn is_crash(&self) -> bool {
        matches!(self, SourceError::TargetCrash(_) | SourceError::Timeout(_))
    }

    /// Returns `true` if running the same input again may succeed.
    ///
    /// Every source error is tied to a single execution, so all of them are transient.
    pub fn is_transient(&self) -> bool {
        true
    }
}

/// Target executable and instrumentation scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Path of the target executable
    pub path: PathBuf,
    /// Architecture of the target
    pub arch: Arch,
    /// Instruction window to instrument
    pub range: AddressRange,
    /// Stack range handed to filter predicates
    #[serde(default)]
    pub stack: StackRange,
    /// Fixed arguments passed before the injected input
    #[serde(default)]
    pub args: Vec<String>,
}

impl TargetSpec {
    /// Creates a target spec with an empty stack range and no fixed arguments.
    pub fn new(path: impl Into<PathBuf>, arch: Arch, range: AddressRange) -> Self {
        TargetSpec {
            path: path.into(),
            arch,
            range,
            stack: StackRange::EMPTY,
            args: vec![],
        }
    }
}

/// Parameters of one execution.
#[derive(Clone, Copy, Debug)]
pub struct RunParams<'a> {
    /// Request ordinal of the run, unique within a session
    pub run: u64,
    /// Target to execute
    pub target: &'a TargetSpec,
    /// Input injected into the target
    pub input: &'a TraceInput,
    /// Maximum wall-clock time of the execution
    pub timeout: Option<Duration>,
}

/// Memory accesses of one running execution, in program order.
///
/// The stream is finite and cannot be restarted. It only yields accesses performed by
/// instructions inside the [`TargetSpec::range`] window. Once the iterator is exhausted,
/// [`finish`](EventStream::finish) returns the observable output of the target.
///
/// Dropping the stream releases every resource of the execution (process, scratch files)
/// on every path, including errors and early returns.
pub trait EventStream: Iterator<Item = Result<AccessEvent, SourceError>> {
    /// Completes the execution and returns the output of the target.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::TargetCrash`] if the target produced no well-formed output.
    fn finish(self: Box<Self>) -> Result<Vec<u8>, SourceError>;
}

/// Trait for instrumentation engines that produce memory access events.
///
/// # Lifecycle
///
/// 1. [`start()`](AccessSource::start) - Launch one execution of the target
/// 2. Iterate the returned [`EventStream`] to completion
/// 3. [`finish()`](EventStream::finish) - Collect the output of the target
///
/// Every call to `start` owns a private execution, so a source may be shared by several
/// worker threads.
pub trait AccessSource: Send + Sync {
    /// Starts one execution of the target.
    ///
    /// # Errors
    ///
    /// * [`SourceError::Launch`] if the target cannot be executed
    /// * [`SourceError::Instrumentation`] if the engine fails to attach
    /// * [`SourceError::TargetCrash`] or [`SourceError::Timeout`] if the target dies
    ///   before any event can be delivered
    fn start<'a>(
        &'a self,
        params: &RunParams<'_>,
    ) -> Result<Box<dyn EventStream + 'a>, SourceError>;
}

impl<S: AccessSource + ?Sized> AccessSource for Arc<S> {
    fn start<'a>(
        &'a self,
        params: &RunParams<'_>,
    ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
        (**self).start(params)
    }
}

impl<S: AccessSource + ?Sized> AccessSource for Box<S> {
    fn start<'a>(
        &'a self,
        params: &RunParams<'_>,
    ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
        (**self).start(params)
    }
}
