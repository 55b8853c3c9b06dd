use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Value extracted from a memory access by a filter.
#[derive(Clone, Debug, PartialEq)]
pub enum LeakValue {
    /// Unsigned integer leakage (addresses, data bytes, ...)
    Unsigned(u128),
    /// Signed integer leakage
    Signed(i128),
    /// Floating point leakage (e.g. weighted models)
    Float(f64),
    /// Raw byte string
    Bytes(Vec<u8>),
}

impl LeakValue {
    fn kind(&self) -> &'static str {
        match self {
            LeakValue::Unsigned(_) => "unsigned integer",
            LeakValue::Signed(_) => "signed integer",
            LeakValue::Float(_) => "float",
            LeakValue::Bytes(_) => "byte string",
        }
    }
}

impl fmt::Display for LeakValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakValue::Unsigned(v) => write!(f, "0x{:x}", v),
            LeakValue::Signed(v) => write!(f, "{}", v),
            LeakValue::Float(v) => write!(f, "{}", v),
            LeakValue::Bytes(b) => write!(f, "{} byte(s)", b.len()),
        }
    }
}

macro_rules! leak_from {
    ($variant:ident, $wide:ty, $($t:ty),+) => {
        $(impl From<$t> for LeakValue {
            fn from(value: $t) -> Self {
                LeakValue::$variant(value as $wide)
            }
        })+
    };
}

leak_from!(Unsigned, u128, u8, u16, u32, u64, u128, usize);
leak_from!(Signed, i128, i8, i16, i32, i64, i128, isize);
leak_from!(Float, f64, f32, f64);

impl From<Vec<u8>> for LeakValue {
    fn from(value: Vec<u8>) -> Self {
        LeakValue::Bytes(value)
    }
}

/// Errors raised when a leakage value does not fit its declared pack format.
///
/// Values are never truncated: silently cut samples would corrupt the statistics of the
/// downstream attack.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PackError {
    /// The value exceeds the width of the format.
    #[error("Value {value} does not fit pack format {format}")]
    Overflow {
        /// Offending value
        value: String,
        /// Declared format
        format: PackFormat,
    },
    /// The value type cannot be represented by the format at all.
    #[error("Cannot pack a {kind} as {format}")]
    Incompatible {
        /// Kind of the offending value
        kind: &'static str,
        /// Declared format
        format: PackFormat,
    },
}

/// Byte order of packed samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

/// Sample type of a pack format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PackType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// Fixed-length byte string
    Bytes(usize),
}

impl PackType {
    /// Packed width in bytes.
    pub const fn width(&self) -> usize {
        match self {
            PackType::U8 | PackType::I8 => 1,
            PackType::U16 | PackType::I16 => 2,
            PackType::U32 | PackType::I32 | PackType::F32 => 4,
            PackType::U64 | PackType::I64 | PackType::F64 => 8,
            PackType::Bytes(n) => *n,
        }
    }

    const fn code(&self) -> char {
        match self {
            PackType::U8 => 'B',
            PackType::I8 => 'b',
            PackType::U16 => 'H',
            PackType::I16 => 'h',
            PackType::U32 => 'I',
            PackType::I32 => 'i',
            PackType::U64 => 'Q',
            PackType::I64 => 'q',
            PackType::F32 => 'f',
            PackType::F64 => 'd',
            PackType::Bytes(_) => 's',
        }
    }

    const fn is_signed(&self) -> bool {
        matches!(
            self,
            PackType::I8 | PackType::I16 | PackType::I32 | PackType::I64
        )
    }
}

/// Descriptor of how one leakage sample is serialized.
///
/// Parsed from struct-style format strings such as `"<B"` (one unsigned byte), `">I"`
/// (big-endian 32-bit word), `"<d"` (little-endian double) or `"16s"` (16 raw bytes).
/// Native order (`=`/`@`) resolves to the byte order of the host at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackFormat {
    /// Byte order of multi-byte samples
    pub order: ByteOrder,
    /// Sample type
    pub ty: PackType,
}

impl PackFormat {
    /// One unsigned byte, the format of the classic DCA filters.
    pub const BYTE: PackFormat = PackFormat {
        order: ByteOrder::Little,
        ty: PackType::U8,
    };

    /// Packed width of one sample in bytes.
    pub const fn width(&self) -> usize {
        self.ty.width()
    }

    /// Appends the packed representation of `value` to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Overflow`] if the value exceeds the declared width and
    /// [`PackError::Incompatible`] if its type cannot be represented. `out` is left untouched
    /// on error.
    pub fn pack(&self, value: &LeakValue, out: &mut Vec<u8>) -> Result<(), PackError> {
        let overflow = || PackError::Overflow {
            value: value.to_string(),
            format: *self,
        };
        let incompatible = || PackError::Incompatible {
            kind: value.kind(),
            format: *self,
        };
        match (self.ty, value) {
            (PackType::F32, LeakValue::Float(v)) => {
                if v.is_finite() && v.abs() > f32::MAX as f64 {
                    return Err(overflow());
                }
                self.put_bytes(&(*v as f32).to_le_bytes(), out);
            }
            (PackType::F32, LeakValue::Unsigned(v)) => {
                self.put_bytes(&(*v as f32).to_le_bytes(), out)
            }
            (PackType::F32, LeakValue::Signed(v)) => {
                self.put_bytes(&(*v as f32).to_le_bytes(), out)
            }
            (PackType::F64, LeakValue::Float(v)) => self.put_bytes(&v.to_le_bytes(), out),
            (PackType::F64, LeakValue::Unsigned(v)) => {
                self.put_bytes(&(*v as f64).to_le_bytes(), out)
            }
            (PackType::F64, LeakValue::Signed(v)) => {
                self.put_bytes(&(*v as f64).to_le_bytes(), out)
            }
            (PackType::Bytes(n), LeakValue::Bytes(b)) => {
                if b.len() > n {
                    return Err(overflow());
                }
                if b.len() < n {
                    return Err(incompatible());
                }
                out.extend_from_slice(b);
            }
            (PackType::Bytes(_), _) | (_, LeakValue::Bytes(_)) | (_, LeakValue::Float(_)) => {
                return Err(incompatible());
            }
            (ty, LeakValue::Unsigned(v)) => {
                let bits = ty.width() as u32 * 8 - ty.is_signed() as u32;
                if bits < 128 && *v >> bits != 0 {
                    return Err(overflow());
                }
                self.put_bytes(&v.to_le_bytes()[..ty.width()], out);
            }
            (ty, LeakValue::Signed(v)) => {
                let bits = ty.width() as u32 * 8;
                let fits = if ty.is_signed() {
                    let min = -(1i128 << (bits - 1));
                    let max = (1i128 << (bits - 1)) - 1;
                    (min..=max).contains(v)
                } else {
                    *v >= 0 && (*v as u128) >> bits == 0
                };
                if !fits {
                    return Err(overflow());
                }
                self.put_bytes(&v.to_le_bytes()[..ty.width()], out);
            }
        }
        Ok(())
    }

    /// Writes little-endian `bytes` in the byte order of this format.
    fn put_bytes(&self, bytes: &[u8], out: &mut Vec<u8>) {
        match self.order {
            ByteOrder::Little => out.extend_from_slice(bytes),
            ByteOrder::Big => out.extend(bytes.iter().rev()),
        }
    }
}

impl FromStr for PackFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigError::PackFormat(s.to_string());
        let mut rest = s.trim();
        let order = match rest.chars().next() {
            Some('<') => ByteOrder::Little,
            Some('>') | Some('!') => ByteOrder::Big,
            Some('=') | Some('@') if cfg!(target_endian = "big") => ByteOrder::Big,
            Some('=') | Some('@') => ByteOrder::Little,
            _ => ByteOrder::Little,
        };
        if rest.starts_with(['<', '>', '!', '=', '@']) {
            rest = &rest[1..];
        }
        let ty = if let Some(count) = rest.strip_suffix('s') {
            let n = if count.is_empty() {
                1
            } else {
                count.parse::<usize>().map_err(|_| err())?
            };
            if n == 0 {
                return Err(err());
            }
            PackType::Bytes(n)
        } else {
            match rest {
                "B" => PackType::U8,
                "b" => PackType::I8,
                "H" => PackType::U16,
                "h" => PackType::I16,
                "I" | "L" => PackType::U32,
                "i" | "l" => PackType::I32,
                "Q" => PackType::U64,
                "q" => PackType::I64,
                "f" => PackType::F32,
                "d" => PackType::F64,
                _ => return Err(err()),
            }
        };
        Ok(PackFormat { order, ty })
    }
}

impl fmt::Display for PackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.order {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
        };
        match self.ty {
            PackType::Bytes(n) => write!(f, "{}{}s", order, n),
            ty => write!(f, "{}{}", order, ty.code()),
        }
    }
}

impl TryFrom<String> for PackFormat {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackFormat> for String {
    fn from(format: PackFormat) -> Self {
        format.to_string()
    }
}
