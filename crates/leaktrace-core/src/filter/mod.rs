//! Filters turn raw memory access events into leakage samples.
//!
//! A [`Filter`] is a named rule made of four decoupled parts:
//!
//! - the access kinds it watches ([`KindSet`]),
//! - a [`Predicate`] deciding whether an access qualifies,
//! - an [`Extractor`] turning a qualifying access into a [`LeakValue`],
//! - a [`PackFormat`] describing how the value is serialized.
//!
//! Predicates and extractors can be closures, the declarative [`Condition`] and [`Extract`]
//! descriptions loaded from configuration files, or any user type implementing the traits.
//!
//! # Purity
//!
//! Predicates and extractors must be pure functions of their arguments. Sample order within
//! a filter must be fully determined by the arrival order of events, otherwise the columns of
//! different traces no longer align for the downstream attack. Filters are shared between
//! worker threads without locking, which is why both traits require `Send + Sync`.

mod pack;
pub mod presets;
mod spec;

pub use self::pack::{ByteOrder, LeakValue, PackError, PackFormat, PackType};
pub use self::spec::{Condition, Extract, FilterSpec};

use crate::error::ConfigError;
use crate::event::{AccessEvent, KindSet, StackRange};
use crate::trace::Samples;
use itertools::Itertools;
use log::trace;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Decides whether a memory access qualifies for a filter.
pub trait Predicate: Send + Sync {
    /// Returns `true` if the access at `addr` of `size` bytes carrying `data` qualifies.
    fn matches(&self, stack: StackRange, addr: u64, size: u32, data: u128) -> bool;
}

/// Turns a qualifying memory access into a leakage value.
pub trait Extractor: Send + Sync {
    /// Extracts the leakage value of the access at `addr` of `size` bytes carrying `data`.
    fn extract(&self, addr: u64, size: u32, data: u128) -> LeakValue;
}

impl<F> Predicate for F
where
    F: Fn(StackRange, u64, u32, u128) -> bool + Send + Sync,
{
    fn matches(&self, stack: StackRange, addr: u64, size: u32, data: u128) -> bool {
        self(stack, addr, size, data)
    }
}

impl<F, V> Extractor for F
where
    F: Fn(u64, u32, u128) -> V + Send + Sync,
    V: Into<LeakValue>,
{
    fn extract(&self, addr: u64, size: u32, data: u128) -> LeakValue {
        self(addr, size, data).into()
    }
}

/// Error raised while sampling an event.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("Filter {filter:?}: {source}")]
pub struct FilterError {
    /// Name of the filter that failed
    pub filter: String,
    /// Underlying packing error
    #[source]
    pub source: PackError,
}

/// A named leakage filter.
///
/// Filters are immutable once constructed and cheap to clone.
#[derive(Clone)]
pub struct Filter {
    name: String,
    kinds: KindSet,
    predicate: Arc<dyn Predicate>,
    extractor: Arc<dyn Extractor>,
    format: PackFormat,
}

impl Filter {
    /// Creates a new filter.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name, used to label the exported columns
    /// * `kinds` - Access kinds the filter watches
    /// * `predicate` - Qualification rule, called with `(stack, addr, size, data)`
    /// * `extractor` - Leakage extraction, called with `(addr, size, data)`
    /// * `format` - Serialization of each sample
    ///
    /// # Examples
    ///
    /// ```
    /// use leaktrace_core::event::KindSet;
    /// use leaktrace_core::filter::{Filter, PackFormat};
    ///
    /// let data_w = Filter::new(
    ///     "data_W",
    ///     KindSet::WRITE,
    ///     |_stack, _addr, size, _data| size <= 4,
    ///     |_addr, _size, data| (data & 0xFF) as u8,
    ///     PackFormat::BYTE,
    /// );
    /// assert_eq!(data_w.name(), "data_W");
    /// ```
    pub fn new<P, E, V>(
        name: impl Into<String>,
        kinds: KindSet,
        predicate: P,
        extractor: E,
        format: PackFormat,
    ) -> Self
    where
        P: Fn(StackRange, u64, u32, u128) -> bool + Send + Sync + 'static,
        E: Fn(u64, u32, u128) -> V + Send + Sync + 'static,
        V: Into<LeakValue>,
    {
        Self::from_parts(name, kinds, predicate, extractor, format)
    }

    /// Creates a new filter from arbitrary [`Predicate`] and [`Extractor`] implementations.
    pub fn from_parts(
        name: impl Into<String>,
        kinds: KindSet,
        predicate: impl Predicate + 'static,
        extractor: impl Extractor + 'static,
        format: PackFormat,
    ) -> Self {
        Filter {
            name: name.into(),
            kinds,
            predicate: Arc::new(predicate),
            extractor: Arc::new(extractor),
            format,
        }
    }

    /// Name of the filter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watched access kinds.
    pub fn kinds(&self) -> KindSet {
        self.kinds
    }

    /// Sample serialization.
    pub fn format(&self) -> PackFormat {
        self.format
    }

    /// Applies the filter to `event`.
    ///
    /// Returns `None` if the filter does not watch the kind of the event or if the predicate
    /// rejects it. Neither case has side effects.
    #[inline]
    pub fn apply(&self, event: &AccessEvent) -> Option<LeakValue> {
        if !self.kinds.contains(event.kind) {
            return None;
        }
        if !self
            .predicate
            .matches(event.stack, event.address, event.size, event.data)
        {
            return None;
        }
        Some(self.extractor.extract(event.address, event.size, event.data))
    }

    /// Applies the filter to `event` and appends the packed sample to `samples`.
    ///
    /// Returns whether a sample was produced.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] naming this filter if the extracted value does not fit the
    /// pack format. Nothing is appended in that case.
    pub fn sample(&self, event: &AccessEvent, samples: &mut Samples) -> Result<bool, FilterError> {
        let Some(value) = self.apply(event) else {
            return Ok(false);
        };
        trace!("{}: {} from {:?}", self.name, value, event);
        samples
            .push(self.format, &value)
            .map_err(|source| FilterError {
                filter: self.name.clone(),
                source,
            })?;
        Ok(true)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Checks that a filter set is well-formed.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a name is empty, a name is used twice, or a filter watches
/// no access kinds.
pub fn validate_filters(filters: &[Filter]) -> Result<(), ConfigError> {
    if filters.iter().any(|f| f.name.is_empty()) {
        return Err(ConfigError::EmptyFilterName);
    }
    if let Some(f) = filters.iter().find(|f| f.kinds.is_empty()) {
        return Err(ConfigError::NoKinds(f.name.clone()));
    }
    if let Some(name) = filters.iter().map(|f| f.name.as_str()).duplicates().next() {
        return Err(ConfigError::DuplicateFilter(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AccessKind;

    fn event(kind: AccessKind, address: u64, size: u32, data: u128) -> AccessEvent {
        AccessEvent {
            kind,
            pc: 0x1000,
            address,
            size,
            data,
            stack: StackRange::EMPTY,
        }
    }

    fn data_byte(name: &str, kinds: KindSet) -> Filter {
        Filter::new(
            name,
            kinds,
            |_, _, size, _| size <= 4,
            |_, _, data: u128| data & 0xFF,
            PackFormat::BYTE,
        )
    }

    #[test]
    fn test_unwatched_kind_is_noop() {
        let filter = data_byte("data_W", KindSet::WRITE);
        let mut samples = Samples::default();
        let read = event(AccessKind::Read, 0x10, 1, 0x42);
        assert_eq!(filter.apply(&read), None);
        assert!(!filter.sample(&read, &mut samples).unwrap());
        assert_eq!(samples.count(), 0);
        assert!(samples.bytes().is_empty());
    }

    #[test]
    fn test_predicate_gates_extraction() {
        let filter = data_byte("data_RW", KindSet::ALL);
        assert_eq!(
            filter.apply(&event(AccessKind::Read, 0x10, 4, 0x1234)),
            Some(LeakValue::Unsigned(0x34))
        );
        assert_eq!(filter.apply(&event(AccessKind::Write, 0x10, 8, 0x1234)), None);
    }

    #[test]
    fn test_sample_packs_in_order() {
        let filter = data_byte("data_W", KindSet::WRITE);
        let mut samples = Samples::default();
        for data in [0x42, 0x1ff, 0x07] {
            assert!(
                filter
                    .sample(&event(AccessKind::Write, 0x10, 1, data), &mut samples)
                    .unwrap()
            );
        }
        assert_eq!(samples.count(), 3);
        assert_eq!(samples.bytes(), &[0x42, 0xff, 0x07]);
    }

    #[test]
    fn test_overflow_names_filter() {
        let filter = Filter::new(
            "addr_W",
            KindSet::WRITE,
            |_, _, _, _| true,
            |addr: u64, _, _| addr,
            PackFormat::BYTE,
        );
        let mut samples = Samples::default();
        let err = filter
            .sample(&event(AccessKind::Write, 0x1234, 1, 0), &mut samples)
            .unwrap_err();
        assert_eq!(err.filter, "addr_W");
        assert!(matches!(err.source, PackError::Overflow { .. }));
        assert_eq!(samples.count(), 0);
    }

    #[test]
    fn test_validate_filters() {
        let ok = vec![
            data_byte("data_R", KindSet::READ),
            data_byte("data_W", KindSet::WRITE),
        ];
        assert!(validate_filters(&ok).is_ok());

        let dup = vec![
            data_byte("data_W", KindSet::READ),
            data_byte("data_W", KindSet::WRITE),
        ];
        assert_eq!(
            validate_filters(&dup),
            Err(ConfigError::DuplicateFilter("data_W".into()))
        );

        let empty = vec![data_byte("", KindSet::READ)];
        assert_eq!(validate_filters(&empty), Err(ConfigError::EmptyFilterName));
    }
}
