//! kntrl userspace library
//!
//! Control plane for the kntrl egress filter: loads the eBPF object,
//! attaches its programs, configures the enforcement mode, maintains the
//! allow-list and consumes connection events until shutdown.

pub mod allow;
pub mod attach;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod events;
pub mod loader;
pub mod mode;
pub mod reporter;
pub mod resolver;
pub mod seed;
pub mod shutdown;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use allow::{AllowList, AllowManager, AllowMap};
pub use config::{EngineConfig, Mode};
pub use engine::{run, RunSummary};
pub use error::{ConfigError, EngineError};
pub use events::{PerfReader, ReadError};
pub use loader::ProbeLoader;
pub use reporter::Reporter;
pub use types::{decode_ip4_event, Connection, DecodeError};
