use leaktrace_core::arch::Arch;
use leaktrace_core::source::SourceError;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors of a TracerGrind run.
///
/// Every variant maps onto one class of [`SourceError`].
#[derive(Debug, Error)]
pub enum TracerGrindError {
    /// The target is missing or not executable.
    #[error("Target {path:?} is not executable: {source}")]
    NotExecutable {
        /// Target path
        path: PathBuf,
        /// Reason reported by the OS
        source: io::Error,
    },
    /// The target is an ELF binary of another architecture.
    #[error("Target {path:?} has ELF machine {found}, expected {expected} for {arch}")]
    WrongArch {
        /// Target path
        path: PathBuf,
        /// Configured architecture
        arch: Arch,
        /// `e_machine` of the configured architecture
        expected: u16,
        /// `e_machine` of the binary
        found: u16,
    },
    /// A tool could not be started.
    #[error("Failed to start {tool:?}: {source}")]
    Spawn {
        /// Tool path
        tool: PathBuf,
        /// Reason reported by the OS
        source: io::Error,
    },
    /// A tool exited unsuccessfully.
    #[error("{tool:?} failed with {status}")]
    ToolFailed {
        /// Tool path
        tool: PathBuf,
        /// Exit status of the tool
        status: ExitStatus,
    },
    /// Valgrind finished without writing a trace.
    #[error("No trace written to {0:?}")]
    MissingTrace(PathBuf),
    /// Scratch files could not be created or read.
    #[error("Scratch file error: {0}")]
    Scratch(#[from] io::Error),
    /// The target was terminated by a signal.
    #[error("Target killed by signal {0}")]
    Signal(i32),
    /// The target exited with a status reserved for abnormal termination.
    #[error("Target exited with status {0}")]
    AbnormalExit(i32),
    /// The target printed no well-formed output line.
    #[error("Target printed no well-formed line starting with {0:?}")]
    NoOutput(String),
    /// The target exceeded the run timeout.
    #[error("Target exceeded the timeout of {0:?}")]
    Timeout(Duration),
    /// A memory line of the text trace is malformed.
    #[error("Malformed trace line {line}: {reason}")]
    Parse {
        /// Line number, starting at 1
        line: usize,
        /// What is wrong with the line
        reason: String,
    },
}

impl From<TracerGrindError> for SourceError {
    fn from(e: TracerGrindError) -> Self {
        match e {
            TracerGrindError::NotExecutable { .. } | TracerGrindError::WrongArch { .. } => {
                SourceError::Launch(e.to_string())
            }
            TracerGrindError::Signal(_)
            | TracerGrindError::AbnormalExit(_)
            | TracerGrindError::NoOutput(_) => SourceError::TargetCrash(e.to_string()),
            TracerGrindError::Timeout(timeout) => SourceError::Timeout(timeout),
            TracerGrindError::Spawn { .. }
            | TracerGrindError::ToolFailed { .. }
            | TracerGrindError::MissingTrace(_)
            | TracerGrindError::Scratch(_)
            | TracerGrindError::Parse { .. } => SourceError::Instrumentation(e.to_string()),
        }
    }
}
