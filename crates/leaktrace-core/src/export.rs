//! Export bridge towards correlation power analysis engines.
//!
//! CPA engines expect one matrix per leakage column: every trace must contribute the same
//! number of samples, and plaintexts, keys and outputs must have a constant width.
//! [`ExportLayout`] checks these conditions once for the whole store; exporters only
//! serialize a layout that passed them, so a misaligned store never produces partial files.

use crate::error::ConfigError;
use crate::filter::PackFormat;
use crate::trace::TraceStore;
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Pseudo-column of the plaintexts in mismatch errors.
pub const PLAINTEXT_COLUMN: &str = "plaintext";
/// Pseudo-column of the keys in mismatch errors.
pub const KEY_COLUMN: &str = "key";
/// Pseudo-column of the outputs in mismatch errors.
pub const OUTPUT_COLUMN: &str = "output";

/// Attack configuration handed to the CPA engine.
///
/// The engine interprets `algorithm` and `position`; they are passed through verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Label of the attack, used in file names
    pub name: String,
    /// Cipher identifier, e.g. `AES`
    pub algorithm: String,
    /// Intermediate value targeted by the attack, e.g. `LUT/AES_AFTER_SBOX`
    pub position: String,
}

impl AttackConfig {
    /// Creates an attack configuration.
    pub fn new(
        name: impl Into<String>,
        algorithm: impl Into<String>,
        position: impl Into<String>,
    ) -> Self {
        AttackConfig {
            name: name.into(),
            algorithm: algorithm.into(),
            position: position.into(),
        }
    }
}

impl FromStr for AttackConfig {
    type Err = ConfigError;

    /// Parses `NAME=ALGORITHM:POSITION`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::AttackConfig(s.to_string());
        let (name, rest) = s.split_once('=').ok_or_else(err)?;
        let (algorithm, position) = rest.split_once(':').ok_or_else(err)?;
        let (name, algorithm, position) = (name.trim(), algorithm.trim(), position.trim());
        if name.is_empty() || algorithm.is_empty() || position.is_empty() {
            return Err(err());
        }
        Ok(AttackConfig::new(name, algorithm, position))
    }
}

impl fmt::Display for AttackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.name, self.algorithm, self.position)
    }
}

/// Errors that abort an export.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// The store holds no traces.
    #[error("Nothing to export: the trace store is empty")]
    EmptyStore,
    /// A requested filter was not collected.
    #[error("Unknown filter {0:?}")]
    UnknownFilter(String),
    /// Traces disagree on the length of one or more columns.
    #[error("Misaligned columns: {}", describe(.0))]
    ColumnLengthMismatch(Vec<ColumnMismatch>),
}

/// A column whose length in some trace differs from trace 0.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{filter:?} has {actual} entries in trace {trace}, expected {expected} as in trace 0")]
pub struct ColumnMismatch {
    /// Filter name, or one of the input/output pseudo-columns
    pub filter: String,
    /// Length in trace 0
    pub expected: usize,
    /// Length in the first offending trace
    pub actual: usize,
    /// Index of the first offending trace
    pub trace: usize,
}

fn describe(mismatches: &[ColumnMismatch]) -> String {
    mismatches.iter().join("; ")
}

/// One exported leakage column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    /// Filter name
    pub name: String,
    /// Position of the filter in the store layout
    pub position: usize,
    /// Format of every sample
    pub format: PackFormat,
    /// Number of samples per trace
    pub samples: usize,
}

impl Column {
    /// Width of the column in bytes per trace.
    pub fn width(&self) -> usize {
        self.samples * self.format.width()
    }
}

/// Validated shape of an export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportLayout {
    traces: usize,
    plaintext_len: usize,
    key_len: usize,
    output_len: usize,
    fixed_key: Option<Vec<u8>>,
    columns: Vec<Column>,
}

impl ExportLayout {
    /// Validates `store` for the export of `filters`.
    ///
    /// An empty `filters` selects every collected filter. Columns keep the declaration order
    /// of the store regardless of the order of `filters`.
    ///
    /// # Errors
    ///
    /// * [`ExportError::EmptyStore`] if the store holds no traces
    /// * [`ExportError::UnknownFilter`] if a requested filter was not collected
    /// * [`ExportError::ColumnLengthMismatch`] naming every column whose length differs from
    ///   trace 0, each with its first offending trace
    pub fn new(store: &TraceStore, filters: &[String]) -> Result<Self, ExportError> {
        let Some(first) = store.get(0) else {
            return Err(ExportError::EmptyStore);
        };
        if let Some(unknown) = filters
            .iter()
            .find(|name| store.filter_position(name).is_none())
        {
            return Err(ExportError::UnknownFilter(unknown.clone()));
        }
        let columns: Vec<Column> = store
            .layout()
            .iter()
            .enumerate()
            .filter(|(_, f)| filters.is_empty() || filters.contains(&f.name))
            .map(|(position, f)| Column {
                name: f.name.clone(),
                position,
                format: f.format,
                samples: first.leakage()[position].count(),
            })
            .collect();

        let key_len = |t: &crate::trace::Trace| t.input().key.as_ref().map_or(0, Vec::len);
        let plaintext_len = first.input().plaintext.len();
        let first_key_len = key_len(first);
        let output_len = first.output().len();
        let mut fixed_key = first.input().key.clone();

        let mut mismatches: Vec<ColumnMismatch> = vec![];
        for trace in store {
            let lengths = [
                (PLAINTEXT_COLUMN, plaintext_len, trace.input().plaintext.len()),
                (KEY_COLUMN, first_key_len, key_len(trace)),
                (OUTPUT_COLUMN, output_len, trace.output().len()),
            ];
            let filter_lengths = columns.iter().map(|c| {
                (
                    c.name.as_str(),
                    c.samples,
                    trace.leakage()[c.position].count(),
                )
            });
            for (name, expected, actual) in lengths.into_iter().chain(filter_lengths) {
                if expected != actual && !mismatches.iter().any(|m| m.filter == name) {
                    mismatches.push(ColumnMismatch {
                        filter: name.to_string(),
                        expected,
                        actual,
                        trace: trace.index(),
                    });
                }
            }
            if fixed_key.is_some() && fixed_key != trace.input().key {
                fixed_key = None;
            }
        }
        if !mismatches.is_empty() {
            return Err(ExportError::ColumnLengthMismatch(mismatches));
        }

        let layout = ExportLayout {
            traces: store.len(),
            plaintext_len,
            key_len: first_key_len,
            output_len,
            fixed_key,
            columns,
        };
        debug!("Export layout: {:?}", layout);
        Ok(layout)
    }

    /// Number of exported traces.
    pub fn traces(&self) -> usize {
        self.traces
    }

    /// Plaintext width in bytes.
    pub fn plaintext_len(&self) -> usize {
        self.plaintext_len
    }

    /// Key width in bytes, 0 if the target takes no key.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Output width in bytes.
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// The key shared by every trace, if there is one.
    pub fn fixed_key(&self) -> Option<&[u8]> {
        self.fixed_key.as_deref()
    }

    /// Exported columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// Trait for serializers of validated trace stores.
///
/// Implementations must be deterministic: the same store, layout and attack configurations
/// always produce byte-identical output.
pub trait Exporter {
    /// Error type for export operations.
    type Error: std::error::Error + From<ExportError>;

    /// Writes `store` in the shape of `layout`.
    fn export(
        &mut self,
        store: &TraceStore,
        layout: &ExportLayout,
        configs: &[AttackConfig],
    ) -> Result<(), Self::Error>;
}

/// Validates `store` for `filters` and hands it to `exporter`.
///
/// # Errors
///
/// Returns the [`ExportError`] of [`ExportLayout::new`] or the error of the exporter.
pub fn export<E: Exporter + ?Sized>(
    exporter: &mut E,
    store: &TraceStore,
    filters: &[String],
    configs: &[AttackConfig],
) -> Result<ExportLayout, E::Error> {
    let layout = ExportLayout::new(store, filters)?;
    info!(
        "Exporting {} traces, columns {:?}",
        layout.traces(),
        layout.columns().iter().map(|c| &c.name).collect::<Vec<_>>()
    );
    exporter.export(store, &layout, configs)?;
    Ok(layout)
}
