//! Errors raised while validating a campaign configuration.

use thiserror::Error;

/// Errors caused by malformed campaign configuration.
///
/// These indicate a defect in the setup rather than transient target behavior, so
/// they abort the whole session before any run is launched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The address range text could not be parsed or has `low > high`.
    #[error("Invalid address range {0:?}, expected \"0xLOW-0xHIGH\" with LOW <= HIGH")]
    AddressRange(String),
    /// The architecture tag is not supported.
    #[error("Unknown architecture {0:?}")]
    UnknownArch(String),
    /// The access kind is neither read nor write.
    #[error("Unknown access kind {0:?}")]
    UnknownKind(String),
    /// Two filters share a name.
    #[error("Duplicate filter name {0:?}")]
    DuplicateFilter(String),
    /// A filter has an empty name.
    #[error("Filter names must not be empty")]
    EmptyFilterName,
    /// A filter watches no access kinds.
    #[error("Filter {0:?} watches no access kinds")]
    NoKinds(String),
    /// The pack format string is malformed.
    #[error("Invalid pack format {0:?}")]
    PackFormat(String),
    /// A filter preset name is unknown.
    #[error("Unknown filter preset {0:?}")]
    UnknownPreset(String),
    /// An attack configuration could not be parsed.
    #[error("Invalid attack config {0:?}, expected NAME=ALGORITHM:POSITION")]
    AttackConfig(String),
}
