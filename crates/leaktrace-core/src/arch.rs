//! CPU architectures supported by the instrumentation engine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Architecture tag of a target binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Arch {
    /// 32-bit x86
    I386,
    /// 64-bit x86
    Amd64,
    /// 32-bit ARM
    Arm,
    /// 64-bit ARM
    Arm64,
}

impl Arch {
    /// The ELF `e_machine` value binaries of this architecture carry.
    pub const fn elf_machine(&self) -> u16 {
        match self {
            Arch::I386 => 3,
            Arch::Amd64 => 62,
            Arch::Arm => 40,
            Arch::Arm64 => 183,
        }
    }
}

impl FromStr for Arch {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i386" | "x86" => Ok(Arch::I386),
            "amd64" | "x86_64" | "x86-64" => Ok(Arch::Amd64),
            "arm" => Ok(Arch::Arm),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => Err(ConfigError::UnknownArch(s.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::I386 => "i386",
            Arch::Amd64 => "amd64",
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<String> for Arch {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Arch> for String {
    fn from(arch: Arch) -> Self {
        arch.to_string()
    }
}
