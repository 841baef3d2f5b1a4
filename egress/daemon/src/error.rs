//! Error types for the control plane
//!
//! Setup failures surface as [`EngineError`] and abort the run. Runtime
//! faults inside the event loop are logged where they occur and never
//! reach the caller.

use std::{io, path::PathBuf};

use aya::{maps::MapError, programs::ProgramError, BpfError, BtfError};
use thiserror::Error;

/// Invalid user-supplied configuration, detected before any kernel
/// resource is touched
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("[mode] flag is required")]
    MissingMode,

    #[error("[mode] flag is invalid: {0}")]
    InvalidMode(String),

    #[error("invalid attach override '{0}', expected <program>=<target>")]
    InvalidAttachOverride(String),
}

/// Failure to attach one program to its hook
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("program '{program}' was rejected by the kernel: {source}")]
    Load {
        program: String,
        #[source]
        source: ProgramError,
    },

    #[error("failed to attach program '{program}': {source}")]
    Link {
        program: String,
        #[source]
        source: ProgramError,
    },

    #[error("failed to read kernel BTF for '{program}': {source}")]
    Btf {
        program: String,
        #[source]
        source: BtfError,
    },

    #[error("failed to open cgroup {path:?}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("program '{program}' cannot be attached to {target}")]
    TargetMismatch { program: String, target: String },
}

/// Fatal setup failure
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("you need root privileges to run this program")]
    Privilege,

    #[error("failed to remove the locked memory limit: {0}")]
    Memlock(#[source] io::Error),

    #[error("failed to read eBPF object {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load eBPF object {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: BpfError,
    },

    #[error("failed to allocate kernel resources for {path:?}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: BpfError,
    },

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("{0} map not found in eBPF object")]
    MissingMap(&'static str),

    #[error("failed to update {map}: {source}")]
    Map {
        map: &'static str,
        #[source]
        source: MapError,
    },

    #[error("failed to open perf reader on {map}: {source}")]
    PerfReader {
        map: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to initialize the reporter: {0}")]
    Reporter(#[source] io::Error),

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] io::Error),
}

impl EngineError {
    /// Classify an aya load failure into the error the caller acts on
    ///
    /// Loading only creates maps. Programs reach the verifier when they
    /// are attached, so a rejection surfaces as [`AttachError::Load`].
    pub(crate) fn from_load(path: PathBuf, source: BpfError) -> Self {
        match source {
            BpfError::MapError(_) => EngineError::Resource { path, source },
            source => EngineError::Load { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_creation_failure_is_resource() {
        let err = EngineError::from_load(
            PathBuf::from("kntrl.o"),
            BpfError::MapError(MapError::KeyNotFound),
        );
        assert!(matches!(err, EngineError::Resource { .. }));
    }

    #[test]
    fn test_other_load_failures_are_load() {
        let err = EngineError::from_load(
            PathBuf::from("kntrl.o"),
            BpfError::ProgramError(ProgramError::NotLoaded),
        );
        assert!(matches!(err, EngineError::Load { .. }));
    }
}
