//! Columnar trace export.
//!
//! This crate serializes a trace store into a single self-describing file that CPA engines
//! can map column by column. Implements the [`leaktrace_core::export::Exporter`] trait.
//!
//! # File Layout
//!
//! All integers are little-endian.
//!
//! | Offset | Size | Content |
//! |---|---|---|
//! | 0 | 8 | magic `LKTRACE\0` |
//! | 8 | 2 | format version, currently 1 |
//! | 10 | 4 | header length `H` |
//! | 14 | `H` | compact JSON [`ColumnarHeader`] |
//! | 14 + `H` | rest | one record per trace |
//!
//! A record holds the plaintext, the key (if `key_len > 0`), the output and then the packed
//! samples of every exported filter, in declaration order. All records have the same size.

#![warn(missing_docs)]

mod columnar;

pub use columnar::{
    ColumnHeader, ColumnarError, ColumnarFile, ColumnarHeader, ColumnarWriter, MAGIC, Record,
    VERSION, read_columnar,
};
