//! # Leaktrace Core
//!
//! `leaktrace-core` is the foundational library of the Leaktrace trace collection framework.
//! It collects software execution traces of white-box cryptographic implementations and
//! turns them into leakage columns for differential computation analysis (DCA).
//!
//! ## Architecture Overview
//!
//! The pipeline has four stages, each with its own module:
//!
//! - [`source::AccessSource`] - Executes the target under a dynamic instrumentation engine
//!   and yields the memory accesses of one run as an [`source::EventStream`].
//!
//! - [`filter::Filter`] - Selects qualifying accesses and extracts one packed leakage sample
//!   per access.
//!
//! - [`TraceSession`] - Repeats executions with fresh inputs, fans events out to the
//!   filters and appends completed runs to a [`trace::TraceStore`].
//!
//! - [`export::Exporter`] - Validates the store column by column and serializes it for a
//!   correlation power analysis engine.
//!
//! Instrumentation engines and export formats live in plugin crates implementing
//! [`source::AccessSource`] and [`export::Exporter`].
//!
//! ## Platform Support
//!
//! The data model is platform independent. Running real targets requires an
//! instrumentation engine for the target architecture, see [`arch::Arch`].

#![warn(missing_docs)]

pub mod arch;
pub mod error;
pub mod event;
pub mod export;
pub mod filter;
mod session;
pub mod source;
pub mod trace;
pub mod util;

pub use crate::error::ConfigError;
pub use crate::export::{AttackConfig, ColumnMismatch, ExportError, ExportLayout, Exporter, export};
pub use crate::filter::{Filter, PackFormat};
pub use session::{
    Collection, Error, KeyPolicy, RunError, RunFailure, RunReport, SessionConfig, TraceSession,
    TraceSessionBuilder,
};
