//! Memory access events and the address windows that scope them.
//!
//! An [`AccessEvent`] is produced once per instrumented load or store of the target and
//! consumed synchronously by the trace session. Events are never stored wholesale; only the
//! leakage samples extracted from them survive a run.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    /// A load from memory.
    #[serde(rename = "R", alias = "read")]
    Read,
    /// A store to memory.
    #[serde(rename = "W", alias = "write")]
    Write,
}

impl AccessKind {
    const fn bit(self) -> u8 {
        match self {
            AccessKind::Read => 0b01,
            AccessKind::Write => 0b10,
        }
    }
}

impl FromStr for AccessKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "R" | "r" | "read" => Ok(AccessKind::Read),
            "W" | "w" | "write" => Ok(AccessKind::Write),
            other => Err(ConfigError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => write!(f, "R"),
            AccessKind::Write => write!(f, "W"),
        }
    }
}

/// Set of access kinds a filter watches.
///
/// Deserializes from a list such as `["R", "W"]`. Duplicates collapse, an empty list is
/// rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<AccessKind>", into = "Vec<AccessKind>")]
pub struct KindSet(u8);

impl KindSet {
    /// Only reads.
    pub const READ: KindSet = KindSet(0b01);
    /// Only writes.
    pub const WRITE: KindSet = KindSet(0b10);
    /// Reads and writes.
    pub const ALL: KindSet = KindSet(0b11);

    /// Returns `true` if `kind` is part of the set.
    #[inline]
    pub const fn contains(&self, kind: AccessKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns `true` if the set watches nothing.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if no kind is shared with `other`.
    pub const fn is_disjoint(&self, other: &KindSet) -> bool {
        self.0 & other.0 == 0
    }

    /// The kinds of this set, reads first.
    pub fn kinds(&self) -> Vec<AccessKind> {
        [AccessKind::Read, AccessKind::Write]
            .into_iter()
            .filter(|k| self.contains(*k))
            .collect()
    }
}

impl fmt::Debug for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in self.kinds() {
            write!(f, "{}", kind)?;
        }
        Ok(())
    }
}

impl FromIterator<AccessKind> for KindSet {
    fn from_iter<T: IntoIterator<Item = AccessKind>>(iter: T) -> Self {
        KindSet(iter.into_iter().fold(0, |acc, k| acc | k.bit()))
    }
}

impl From<AccessKind> for KindSet {
    fn from(kind: AccessKind) -> Self {
        KindSet(kind.bit())
    }
}

impl TryFrom<Vec<AccessKind>> for KindSet {
    type Error = String;

    fn try_from(kinds: Vec<AccessKind>) -> Result<Self, Self::Error> {
        let set: KindSet = kinds.into_iter().collect();
        if set.is_empty() {
            return Err("a filter must watch at least one access kind".into());
        }
        Ok(set)
    }
}

impl From<KindSet> for Vec<AccessKind> {
    fn from(set: KindSet) -> Self {
        set.kinds()
    }
}

impl FromStr for KindSet {
    type Err = ConfigError;

    /// Parses strings like `"R"`, `"W"` or `"RW"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let set = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .map(|c| c.to_string().parse::<AccessKind>())
            .collect::<Result<KindSet, _>>()?;
        if set.is_empty() {
            return Err(ConfigError::UnknownKind(s.to_string()));
        }
        Ok(set)
    }
}

/// Splits `"0xLOW-0xHIGH"` into its two bounds.
fn parse_hex_range(text: &str) -> Option<(u64, u64)> {
    let (low, high) = text.split_once('-')?;
    Some((parse_hex(low)?, parse_hex(high)?))
}

fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Closed interval of instruction addresses.
///
/// Instrumentation is only active while the program counter of the target lies inside this
/// window. The invariant `low <= high` is enforced by every constructor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressRange {
    low: u64,
    high: u64,
}

impl AddressRange {
    /// Creates a new range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AddressRange`] if `low > high`.
    pub fn new(low: u64, high: u64) -> Result<Self, ConfigError> {
        if low > high {
            return Err(ConfigError::AddressRange(format!("0x{:x}-0x{:x}", low, high)));
        }
        Ok(AddressRange { low, high })
    }

    /// Lower bound (inclusive).
    pub fn low(&self) -> u64 {
        self.low
    }

    /// Upper bound (inclusive).
    pub fn high(&self) -> u64 {
        self.high
    }

    /// Returns `true` if `pc` lies inside the window.
    #[inline]
    pub fn contains(&self, pc: u64) -> bool {
        self.low <= pc && pc <= self.high
    }
}

impl FromStr for AddressRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (low, high) =
            parse_hex_range(s).ok_or_else(|| ConfigError::AddressRange(s.to_string()))?;
        AddressRange::new(low, high).map_err(|_| ConfigError::AddressRange(s.to_string()))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.low, self.high)
    }
}

impl TryFrom<String> for AddressRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressRange> for String {
    fn from(range: AddressRange) -> Self {
        range.to_string()
    }
}

/// Half-open address range `[low, high)` of the stack of the target.
///
/// Handed to every filter predicate so that filters can separate stack traffic from table
/// lookups. [`StackRange::EMPTY`] contains no address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackRange {
    /// Lowest stack address
    pub low: u64,
    /// One past the highest stack address
    pub high: u64,
}

impl StackRange {
    /// A stack range that contains nothing.
    pub const EMPTY: StackRange = StackRange { low: 0, high: 0 };

    /// Returns `true` if `addr` lies on the stack.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.low <= addr && addr < self.high
    }
}

impl FromStr for StackRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_hex_range(s) {
            Some((low, high)) if low <= high => Ok(StackRange { low, high }),
            _ => Err(ConfigError::AddressRange(s.to_string())),
        }
    }
}

impl fmt::Display for StackRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.low, self.high)
    }
}

impl TryFrom<String> for StackRange {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StackRange> for String {
    fn from(range: StackRange) -> Self {
        range.to_string()
    }
}

/// One instrumented memory access of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessEvent {
    /// Whether the access loads or stores
    pub kind: AccessKind,
    /// Address of the instruction performing the access
    pub pc: u64,
    /// Accessed memory address
    pub address: u64,
    /// Access width in bytes
    pub size: u32,
    /// Value read or written. Accesses wider than 16 bytes keep their low 16 bytes.
    pub data: u128,
    /// Stack range of the target at the time of the access
    pub stack: StackRange,
}
