//! Scripted access event source.
//!
//! This crate provides an [`AccessSource`](leaktrace_core::source::AccessSource) that
//! replays synthetic executions instead of running a target. Each run is described by a
//! [`Script`] built from the run parameters, so tests can derive accesses and outputs from
//! the injected plaintext just like a real cipher would.
//!
//! # Use Cases
//!
//! - Integration testing of the Leaktrace pipeline
//! - Dry runs of filter and export configurations without an instrumentation engine

#![warn(missing_docs)]

mod script;

pub use script::{Script, ScriptedSource};
