use super::{Extractor, Filter, LeakValue, PackFormat, Predicate};
use crate::event::{KindSet, StackRange};
use serde::{Deserialize, Serialize};

fn default_mask() -> u64 {
    0xFF
}

/// Declarative filter predicate, as found in campaign files.
///
/// ```json
/// { "op": "all", "of": [ { "op": "size_at_most", "bytes": 4 }, { "op": "outside_stack" } ] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Every access qualifies.
    Always,
    /// Accesses of at most `bytes` bytes.
    SizeAtMost {
        /// Maximum access width
        bytes: u32,
    },
    /// Accesses of exactly `bytes` bytes.
    SizeEquals {
        /// Access width
        bytes: u32,
    },
    /// Accesses to the stack.
    InStack,
    /// Accesses outside the stack.
    OutsideStack,
    /// Accesses to memory addresses in `[low, high]`.
    AddressWithin {
        /// Lowest address (inclusive)
        low: u64,
        /// Highest address (inclusive)
        high: u64,
    },
    /// All nested conditions hold.
    All {
        /// Nested conditions
        of: Vec<Condition>,
    },
    /// At least one nested condition holds.
    Any {
        /// Nested conditions
        of: Vec<Condition>,
    },
    /// The nested condition does not hold.
    Not {
        /// Negated condition
        cond: Box<Condition>,
    },
}

impl Predicate for Condition {
    fn matches(&self, stack: StackRange, addr: u64, size: u32, data: u128) -> bool {
        match self {
            Condition::Always => true,
            Condition::SizeAtMost { bytes } => size <= *bytes,
            Condition::SizeEquals { bytes } => size == *bytes,
            Condition::InStack => stack.contains(addr),
            Condition::OutsideStack => !stack.contains(addr),
            Condition::AddressWithin { low, high } => *low <= addr && addr <= *high,
            Condition::All { of } => of.iter().all(|c| c.matches(stack, addr, size, data)),
            Condition::Any { of } => of.iter().any(|c| c.matches(stack, addr, size, data)),
            Condition::Not { cond } => !cond.matches(stack, addr, size, data),
        }
    }
}

/// Declarative leakage extractor, as found in campaign files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Extract {
    /// `(data >> shift) & mask`
    Data {
        /// Right shift applied first
        #[serde(default)]
        shift: u32,
        /// Mask applied after shifting, defaults to `0xFF`
        #[serde(default = "default_mask")]
        mask: u64,
    },
    /// `(addr >> shift) & mask`
    Address {
        /// Right shift applied first
        #[serde(default)]
        shift: u32,
        /// Mask applied after shifting, defaults to `0xFF`
        #[serde(default = "default_mask")]
        mask: u64,
    },
    /// The access width in bytes.
    Size,
    /// Hamming weight of `data & mask`.
    DataHammingWeight {
        /// Mask applied before counting, defaults to `0xFF`
        #[serde(default = "default_mask")]
        mask: u64,
    },
}

impl Extractor for Extract {
    fn extract(&self, addr: u64, size: u32, data: u128) -> LeakValue {
        match self {
            Extract::Data { shift, mask } => {
                LeakValue::Unsigned(data.checked_shr(*shift).unwrap_or(0) & *mask as u128)
            }
            Extract::Address { shift, mask } => {
                LeakValue::Unsigned((addr as u128).checked_shr(*shift).unwrap_or(0) & *mask as u128)
            }
            Extract::Size => LeakValue::Unsigned(size as u128),
            Extract::DataHammingWeight { mask } => {
                LeakValue::Unsigned((data & *mask as u128).count_ones() as u128)
            }
        }
    }
}

/// Serializable description of a [`Filter`].
///
/// ```json
/// {
///   "name": "data_W",
///   "kinds": ["W"],
///   "condition": { "op": "size_at_most", "bytes": 4 },
///   "extract": { "op": "data" },
///   "format": "<B"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Unique filter name
    pub name: String,
    /// Watched access kinds
    pub kinds: KindSet,
    /// Qualification rule
    #[serde(default = "FilterSpec::default_condition")]
    pub condition: Condition,
    /// Leakage extraction
    pub extract: Extract,
    /// Sample serialization, defaults to one unsigned byte
    #[serde(default = "FilterSpec::default_format")]
    pub format: PackFormat,
}

impl FilterSpec {
    fn default_condition() -> Condition {
        Condition::Always
    }

    fn default_format() -> PackFormat {
        PackFormat::BYTE
    }

    /// Builds the described filter.
    pub fn build(&self) -> Filter {
        Filter::from_parts(
            self.name.clone(),
            self.kinds,
            self.condition.clone(),
            self.extract.clone(),
            self.format,
        )
    }
}
