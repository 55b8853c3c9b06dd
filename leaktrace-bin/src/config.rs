//! Campaign configuration files.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use leaktrace_core::arch::Arch;
use leaktrace_core::event::{AddressRange, StackRange};
use leaktrace_core::filter::{FilterSpec, presets};
use leaktrace_core::source::TargetSpec;
use leaktrace_core::{AttackConfig, ConfigError, Filter, KeyPolicy, SessionConfig};
use leaktrace_tracergrind::InputMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A filter given either by preset name or by full description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterEntry {
    Preset(String),
    Spec(FilterSpec),
}

impl FilterEntry {
    pub fn build(&self) -> Result<Filter, ConfigError> {
        match self {
            FilterEntry::Preset(name) => presets::by_name(name),
            FilterEntry::Spec(spec) => Ok(spec.build()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Single self-describing columnar file
    Columnar,
    /// Daredevil sample, input, output and config files in a directory
    Daredevil,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackEntry {
    pub algorithm: String,
    pub position: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputChannel {
    #[default]
    Argv,
    Stdin,
}

impl From<InputChannel> for InputMode {
    fn from(channel: InputChannel) -> Self {
        match channel {
            InputChannel::Argv => InputMode::Argv,
            InputChannel::Stdin => InputMode::Stdin,
        }
    }
}

/// Trace collection campaign, as loaded from a JSON file.
///
/// Every field is optional in the file; command line flags override file values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignConfig {
    pub target: Option<PathBuf>,
    pub arch: Arch,
    pub range: Option<AddressRange>,
    pub stack: StackRange,
    pub args: Vec<String>,
    pub runs: u64,
    pub retries: u32,
    pub timeout_secs: Option<u64>,
    pub seed: Option<u64>,
    pub block_size: usize,
    pub key: KeyPolicy,
    pub workers: usize,
    pub input_mode: InputChannel,
    pub output_prefix: String,
    pub filters: Vec<FilterEntry>,
    pub attacks: BTreeMap<String, AttackEntry>,
    pub export: Option<ExportConfig>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        CampaignConfig {
            target: None,
            arch: Arch::Amd64,
            range: None,
            stack: StackRange::EMPTY,
            args: vec![],
            runs: 100,
            retries: session.retries,
            timeout_secs: session.run_timeout.map(|t| t.as_secs()),
            seed: session.seed,
            block_size: session.block_size,
            key: session.key,
            workers: session.workers,
            input_mode: InputChannel::default(),
            output_prefix: "OUTPUT".to_string(),
            filters: vec![FilterEntry::Preset("data_W".to_string())],
            attacks: BTreeMap::new(),
            export: None,
        }
    }
}

impl CampaignConfig {
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<CampaignConfig> {
        let filepath = filepath.as_ref();
        let mut file = File::open(filepath)
            .with_context(|| format!("failed to open {}", filepath.display()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: CampaignConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", filepath.display()))?;
        Ok(config)
    }

    pub fn target_spec(&self) -> Result<TargetSpec> {
        let Some(path) = &self.target else {
            bail!("No target given");
        };
        let Some(range) = self.range else {
            bail!("No address range given");
        };
        let mut target = TargetSpec::new(path.clone(), self.arch, range);
        target.stack = self.stack;
        target.args = self.args.clone();
        Ok(target)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retries: self.retries,
            run_timeout: self.timeout_secs.map(Duration::from_secs),
            seed: self.seed,
            block_size: self.block_size,
            key: self.key.clone(),
            workers: self.workers,
        }
    }

    pub fn filters(&self) -> Result<Vec<Filter>, ConfigError> {
        self.filters.iter().map(FilterEntry::build).collect()
    }

    pub fn attacks(&self) -> Vec<AttackConfig> {
        self.attacks
            .iter()
            .map(|(name, a)| AttackConfig::new(name, &a.algorithm, &a.position))
            .collect()
    }
}
