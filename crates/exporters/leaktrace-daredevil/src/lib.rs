//! Daredevil trace export.
//!
//! This crate writes a trace store in the input format of the Daredevil CPA tool of the
//! SideChannelMarvels project: sample matrices, raw plaintext and output matrices and one
//! INI configuration per attack. Samples are bit-serialized by default, one file byte per
//! leaked bit, which is what Daredevil and bit-oriented DCA readers expect.
//!
//! Implements the [`leaktrace_core::export::Exporter`] trait.

#![warn(missing_docs)]

mod daredevil;

pub use daredevil::{DaredevilError, DaredevilExporter, SampleEncoding};
