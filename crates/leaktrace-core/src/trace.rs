//! Trace records and the append-only store that collects them.

use crate::filter::{Filter, LeakValue, PackError, PackFormat};
use serde::{Deserialize, Serialize};

/// Packed leakage samples of one filter in one run, in event arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Samples {
    count: usize,
    bytes: Vec<u8>,
}

impl Samples {
    /// Packs `value` with `format` and appends it.
    ///
    /// # Errors
    ///
    /// Returns the [`PackError`] of `format`; the samples are unchanged in that case.
    pub fn push(&mut self, format: PackFormat, value: &LeakValue) -> Result<(), PackError> {
        format.pack(value, &mut self.bytes)?;
        self.count += 1;
        Ok(())
    }

    /// Number of samples.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Concatenated packed samples.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Inputs supplied to the target for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInput {
    /// Plaintext block
    pub plaintext: Vec<u8>,
    /// Key, if the target takes one
    pub key: Option<Vec<u8>>,
}

impl TraceInput {
    /// Hex words passed to the target: the plaintext followed by the key, if any.
    pub fn hex_words(&self) -> Vec<String> {
        std::iter::once(&self.plaintext)
            .chain(self.key.as_ref())
            .map(hex::encode)
            .collect()
    }
}

/// Name and sample format of one collected filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLayout {
    /// Filter name
    pub name: String,
    /// Format of every sample of the filter
    pub format: PackFormat,
}

impl From<&Filter> for FilterLayout {
    fn from(filter: &Filter) -> Self {
        FilterLayout {
            name: filter.name().to_string(),
            format: filter.format(),
        }
    }
}

/// One execution of the target: its inputs, its output and its leakage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    index: usize,
    input: TraceInput,
    output: Vec<u8>,
    leakage: Vec<Samples>,
}

impl Trace {
    /// Position of the trace in its store.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Inputs of the run.
    pub fn input(&self) -> &TraceInput {
        &self.input
    }

    /// Observable output of the target.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Leakage per filter, in filter declaration order.
    pub fn leakage(&self) -> &[Samples] {
        &self.leakage
    }
}

/// Ordered collection of traces, in execution order.
///
/// The store is append-only: traces can neither be removed nor modified once pushed, and
/// their indices are dense.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceStore {
    layout: Vec<FilterLayout>,
    traces: Vec<Trace>,
}

impl TraceStore {
    /// Creates an empty store for the given filter layout.
    pub fn new(layout: Vec<FilterLayout>) -> Self {
        TraceStore {
            layout,
            traces: vec![],
        }
    }

    /// Appends a completed run and returns its index.
    ///
    /// # Panics
    ///
    /// Panics if `leakage` does not have one entry per filter of the layout.
    pub fn push(&mut self, input: TraceInput, output: Vec<u8>, leakage: Vec<Samples>) -> usize {
        assert_eq!(
            leakage.len(),
            self.layout.len(),
            "leakage must have one entry per filter"
        );
        let index = self.traces.len();
        self.traces.push(Trace {
            index,
            input,
            output,
            leakage,
        });
        index
    }

    /// Filters collected in this store, in declaration order.
    pub fn layout(&self) -> &[FilterLayout] {
        &self.layout
    }

    /// Position of the filter called `name` in the layout.
    pub fn filter_position(&self, name: &str) -> Option<usize> {
        self.layout.iter().position(|f| f.name == name)
    }

    /// Samples of the filter called `name` in `trace`.
    pub fn samples<'a>(&self, trace: &'a Trace, name: &str) -> Option<&'a Samples> {
        self.filter_position(name).map(|i| &trace.leakage[i])
    }

    /// Number of traces.
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    /// Returns `true` if no trace was collected.
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Trace at `index`.
    pub fn get(&self, index: usize) -> Option<&Trace> {
        self.traces.get(index)
    }

    /// Iterates over the traces in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, Trace> {
        self.traces.iter()
    }
}

impl<'a> IntoIterator for &'a TraceStore {
    type Item = &'a Trace;
    type IntoIter = std::slice::Iter<'a, Trace>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
