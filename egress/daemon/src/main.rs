//! kntrl - eBPF egress control agent
//!
//! Loads the kntrl eBPF object, attaches its programs, seeds the
//! destination allow-list and reports outbound IPv4 connections until
//! interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Observe outbound connections
//! sudo ./kntrl run --mode monitor
//!
//! # Enforce, allowing extra hosts and addresses
//! sudo ./kntrl run --mode trace --allowed-hosts api.example.com --allowed-ips 10.0.0.5
//!
//! # Keep an observation log and a JSON summary
//! sudo ./kntrl run --mode monitor --report-file kntrl.jsonl --output summary.json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kntrl::{
    config::{default_artifact, parse_attach_overrides, SeedConfig, RESOLV_CONF},
    engine::{self, RunSummary},
    EngineConfig,
};
use log::info;
use std::path::PathBuf;

/// Egress control for CI runners using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Enforcement mode (monitor, trace)
    #[clap(long, default_value = "")]
    mode: String,

    /// Comma-separated host names to allow
    #[clap(long, default_value = "")]
    allowed_hosts: String,

    /// Comma-separated IPv4 addresses to allow
    #[clap(long, default_value = "")]
    allowed_ips: String,

    /// Domain fragment that allows matching destinations (repeatable)
    #[clap(long = "allow-suffix")]
    allow_suffixes: Vec<String>,

    /// Path to the eBPF object file
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Attach target override, as program=target (repeatable)
    #[clap(long = "attach")]
    attach: Vec<String>,

    /// Nameserver source for allow-list seeding
    #[clap(long, default_value = RESOLV_CONF)]
    resolv_conf: PathBuf,

    /// JSON-lines log of every observed connection
    #[clap(long)]
    report_file: Option<PathBuf>,

    /// JSON summary written after shutdown
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<EngineConfig> {
        let mut config = EngineConfig {
            mode: self.mode,
            artifact: self.ebpf_object.unwrap_or_else(default_artifact),
            attach_overrides: parse_attach_overrides(&self.attach)?,
            seed: SeedConfig {
                allowed_hosts: self.allowed_hosts,
                allowed_ips: self.allowed_ips,
                resolv_conf: Some(self.resolv_conf),
            },
            report_file: self.report_file,
            summary_file: self.output,
            ..EngineConfig::default()
        };
        if !self.allow_suffixes.is_empty() {
            config.allow_suffixes = self.allow_suffixes;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Command::Run(args) = Cli::parse().command;

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = args.into_config().context("Invalid arguments")?;

    info!("Starting kntrl...");
    info!("   Mode: {}", config.mode);
    info!("   eBPF object: {:?}", config.artifact);
    info!("   Allow suffixes: {}", config.allow_suffixes.join(", "));
    if let Some(path) = &config.report_file {
        info!("   Report file: {:?}", path);
    }

    let summary = engine::run(config).await.context("kntrl engine failed")?;

    print_summary(&summary);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║          kntrl - eBPF egress control              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(summary: &RunSummary) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Mode:               {}", summary.mode);
    info!("  Events processed:   {:>8}", summary.consumer.processed);
    info!("  Malformed records:  {:>8}", summary.consumer.malformed);
    info!("  Read errors:        {:>8}", summary.consumer.read_errors);
    info!("  Closed events:      {:>8}", summary.closed_events);
    info!("  Unique connections: {:>8}", summary.unique_connections);
    info!("");
    info!("  Allow-list:");
    info!("    seeded:           {:>8}", summary.seeded);
    info!("    added at runtime: {:>8}", summary.allow_extended);
    info!("");
    info!("============================================");
}
