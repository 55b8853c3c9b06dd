//! The classic DCA filters.
//!
//! Each preset watches accesses of at most four bytes and records the low byte of either the
//! accessed value (`data_*`) or the accessed address (`addr_*`) as one unsigned byte.

use super::{Condition, Extract, Filter, FilterSpec, PackFormat};
use crate::error::ConfigError;
use crate::event::KindSet;

/// Names of all presets.
pub const NAMES: [&str; 6] = ["data_R", "data_W", "data_RW", "addr_R", "addr_W", "addr_RW"];

/// Description of the preset called `name`.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownPreset`] for names not in [`NAMES`].
pub fn spec(name: &str) -> Result<FilterSpec, ConfigError> {
    let (what, kinds) = name
        .split_once('_')
        .ok_or_else(|| ConfigError::UnknownPreset(name.to_string()))?;
    let extract = match what {
        "data" => Extract::Data {
            shift: 0,
            mask: 0xFF,
        },
        "addr" => Extract::Address {
            shift: 0,
            mask: 0xFF,
        },
        _ => return Err(ConfigError::UnknownPreset(name.to_string())),
    };
    let kinds = match kinds {
        "R" => KindSet::READ,
        "W" => KindSet::WRITE,
        "RW" => KindSet::ALL,
        _ => return Err(ConfigError::UnknownPreset(name.to_string())),
    };
    Ok(FilterSpec {
        name: name.to_string(),
        kinds,
        condition: Condition::SizeAtMost { bytes: 4 },
        extract,
        format: PackFormat::BYTE,
    })
}

/// Builds the preset called `name`.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownPreset`] for names not in [`NAMES`].
pub fn by_name(name: &str) -> Result<Filter, ConfigError> {
    spec(name).map(|spec| spec.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AccessEvent, AccessKind, StackRange};
    use crate::filter::LeakValue;

    #[test]
    fn test_all_presets_build() {
        for name in NAMES {
            let filter = by_name(name).unwrap();
            assert_eq!(filter.name(), name);
            assert_eq!(filter.format(), PackFormat::BYTE);
        }
    }

    #[test]
    fn test_unknown_presets() {
        for name in ["data", "data_X", "key_R", ""] {
            assert_eq!(
                by_name(name).unwrap_err(),
                ConfigError::UnknownPreset(name.to_string())
            );
        }
    }

    #[test]
    fn test_addr_preset_extracts_address() {
        let filter = by_name("addr_R").unwrap();
        let event = AccessEvent {
            kind: AccessKind::Read,
            pc: 0,
            address: 0x601abc,
            size: 4,
            data: 0x11,
            stack: StackRange::EMPTY,
        };
        assert_eq!(filter.apply(&event), Some(LeakValue::Unsigned(0xbc)));
        let wide = AccessEvent { size: 8, ..event };
        assert_eq!(filter.apply(&wide), None);
    }
}
