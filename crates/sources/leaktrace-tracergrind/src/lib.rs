//! TracerGrind access event source.
//!
//! This crate runs the target under Valgrind with the TracerGrind tool of the
//! SideChannelMarvels project, converts the binary trace with `texttrace` and streams the
//! memory accesses of the text trace.
//!
//! Implements the [`leaktrace_core::source::AccessSource`] trait.
//!
//! # Requirements
//!
//! - `valgrind` with the `tracergrind` tool, or `LEAKTRACE_VALGRIND` pointing to it
//! - `texttrace`, or `LEAKTRACE_TEXTTRACE` pointing to it
//! - A target that prints its output on a line starting with a known prefix (`OUTPUT` by
//!   default), e.g. `OUTPUT: 3a d7 ...`

#![warn(missing_docs)]

mod error;
mod output;
mod parser;
mod tracergrind;

pub use error::TracerGrindError;
pub use output::parse_output;
pub use tracergrind::{InputMode, TracerGrind};
