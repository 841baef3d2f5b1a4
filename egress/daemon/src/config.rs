//! Engine configuration
//!
//! Everything the engine needs arrives through [`EngineConfig`]. The mode
//! stays a raw string here; it is validated by the engine before any
//! kernel resource is touched.

use crate::error::ConfigError;
use kntrl_common::{MODE_MONITOR, MODE_TRACE, PERF_BUFFER_BYTES};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

/// Object file produced for x86_64 hosts
pub const ARTIFACT_X86: &str = "./kntrl/bpf_bpfel_x86.o";

/// Object file produced for aarch64 hosts
pub const ARTIFACT_ARM64: &str = "./kntrl/bpf_bpfel_arm64.o";

/// Default nameserver source for allow-list seeding
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Domain suffixes that widen the allow-list when no override is given
pub const DEFAULT_ALLOW_SUFFIXES: [&str; 2] = [".github.com", ".kondukto.io"];

/// Enforcement mode written to the kernel mode map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Observe and log only
    Monitor,
    /// Observe and supply the allow-list for enforcement
    Trace,
}

impl Mode {
    /// Integer code understood by the kernel program
    pub fn code(self) -> u32 {
        match self {
            Mode::Monitor => MODE_MONITOR,
            Mode::Trace => MODE_TRACE,
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(ConfigError::MissingMode),
            "monitor" => Ok(Mode::Monitor),
            "trace" => Ok(Mode::Trace),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Monitor => f.write_str("monitor"),
            Mode::Trace => f.write_str("trace"),
        }
    }
}

/// Conventional artifact path for the architecture this binary was built for
pub fn default_artifact() -> PathBuf {
    if cfg!(target_arch = "aarch64") {
        PathBuf::from(ARTIFACT_ARM64)
    } else {
        PathBuf::from(ARTIFACT_X86)
    }
}

/// Inputs for allow-list seeding
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Comma-separated host names
    pub allowed_hosts: String,
    /// Comma-separated IPv4 literals
    pub allowed_ips: String,
    /// Nameserver source; `None` skips nameserver seeding
    pub resolv_conf: Option<PathBuf>,
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Raw mode string, validated by the engine
    pub mode: String,
    /// Compiled eBPF object
    pub artifact: PathBuf,
    /// Per-program attach target overrides (program name -> symbol)
    pub attach_overrides: BTreeMap<String, String>,
    /// Allow-list seeding inputs
    pub seed: SeedConfig,
    /// Name fragments that widen the allow-list at runtime
    pub allow_suffixes: Vec<String>,
    /// Optional JSON-lines observation log kept by the reporter
    pub report_file: Option<PathBuf>,
    /// Optional pretty JSON summary written after shutdown
    pub summary_file: Option<PathBuf>,
    /// Per-CPU perf buffer size in bytes
    pub perf_buffer_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: String::new(),
            artifact: default_artifact(),
            attach_overrides: BTreeMap::new(),
            seed: SeedConfig {
                resolv_conf: Some(PathBuf::from(RESOLV_CONF)),
                ..SeedConfig::default()
            },
            allow_suffixes: DEFAULT_ALLOW_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            report_file: None,
            summary_file: None,
            perf_buffer_bytes: PERF_BUFFER_BYTES,
        }
    }
}

/// Parse `program=target` attach overrides
pub fn parse_attach_overrides<I, S>(items: I) -> Result<BTreeMap<String, String>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut overrides = BTreeMap::new();
    for item in items {
        let item = item.as_ref();
        match item.split_once('=') {
            Some((program, target)) if !program.trim().is_empty() && !target.trim().is_empty() => {
                overrides.insert(program.trim().to_string(), target.trim().to_string());
            }
            _ => return Err(ConfigError::InvalidAttachOverride(item.to_string())),
        }
    }
    Ok(overrides)
}
