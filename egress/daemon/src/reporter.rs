//! Run reporter
//!
//! Aggregates the connections observed during a run and prints a summary
//! once the event loop has stopped.

use crate::types::Connection;
use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

/// One observation, as written to the observation log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// RFC 3339 time the event was processed
    pub timestamp: String,
    pub pid: u32,
    pub task: String,
    pub daddr: Ipv4Addr,
    pub dport: u16,
    pub domains: Vec<String>,
    /// Whether the destination matched an allow suffix
    pub allowed: bool,
}

/// Aggregate for one (task, destination, port)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub task: String,
    pub destination: String,
    pub domains: Vec<String>,
    pub connections: u64,
    pub allowed: bool,
}

/// Serializable summary of a run
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReportSummary {
    /// ISO 8601 timestamp when the summary was produced
    pub timestamp: String,
    pub total_events: u64,
    pub unique_destinations: usize,
    pub connections: Vec<ConnectionSummary>,
}

type ConnectionKey = (String, Ipv4Addr, u16);

/// Accumulator for observed connections
pub struct Reporter {
    connections: BTreeMap<ConnectionKey, ConnectionSummary>,
    total_events: u64,
    log: Option<(PathBuf, BufWriter<File>)>,
}

impl Reporter {
    /// Create a reporter, optionally keeping a JSON-lines observation log
    pub fn new(log_path: Option<&Path>) -> io::Result<Self> {
        let log = match log_path {
            Some(path) => Some((path.to_path_buf(), BufWriter::new(File::create(path)?))),
            None => None,
        };

        Ok(Self {
            connections: BTreeMap::new(),
            total_events: 0,
            log,
        })
    }

    /// Add one observed connection
    pub fn record(&mut self, conn: &Connection, domains: &[String], allowed: bool) {
        self.total_events += 1;

        let entry = self
            .connections
            .entry((conn.task.clone(), conn.daddr, conn.dport))
            .or_insert_with(|| ConnectionSummary {
                task: conn.task.clone(),
                destination: format!("{}:{}", conn.daddr, conn.dport),
                domains: domains.to_vec(),
                connections: 0,
                allowed,
            });
        entry.connections += 1;
        entry.allowed |= allowed;

        if let Some((path, writer)) = self.log.as_mut() {
            let observation = Observation {
                timestamp: chrono::Utc::now().to_rfc3339(),
                pid: conn.pid,
                task: conn.task.clone(),
                daddr: conn.daddr,
                dport: conn.dport,
                domains: domains.to_vec(),
                allowed,
            };
            let written = serde_json::to_writer(&mut *writer, &observation)
                .map_err(io::Error::from)
                .and_then(|_| writer.write_all(b"\n"));
            if let Err(e) = written {
                warn!("failed to append to report {:?}: {}", path, e);
            }
        }
    }

    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn summary(&self) -> ReportSummary {
        let unique_destinations = self
            .connections
            .keys()
            .map(|(_, daddr, _)| *daddr)
            .collect::<std::collections::BTreeSet<_>>()
            .len();

        ReportSummary {
            timestamp: chrono::Utc::now().to_rfc3339(),
            total_events: self.total_events,
            unique_destinations,
            connections: self.connections.values().cloned().collect(),
        }
    }

    /// Human-readable summary table
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<16} {:<21} {:>6} {:<7} {}\n",
            "TASK", "DESTINATION", "COUNT", "ALLOWED", "DOMAINS"
        ));
        for summary in self.connections.values() {
            out.push_str(&format!(
                "{:<16} {:<21} {:>6} {:<7} {}\n",
                summary.task,
                summary.destination,
                summary.connections,
                if summary.allowed { "yes" } else { "no" },
                summary.domains.join(",")
            ));
        }
        out.push_str(&format!(
            "{} event(s), {} connection(s)\n",
            self.total_events,
            self.connections.len()
        ));
        out
    }

    /// Print the summary to stdout
    pub fn print(&self) {
        println!("----");
        println!();
        print!("{}", self.render());
        println!("----");
    }

    /// Flush and close the observation log
    pub fn clean(&mut self) {
        if let Some((path, mut writer)) = self.log.take() {
            if let Err(e) = writer.flush() {
                warn!("failed to flush report {:?}: {}", path, e);
            }
        }
    }

    /// Write the summary as pretty JSON
    pub fn export_json(&self, output_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.summary())?;

        let mut file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {:?}", output_path))?;

        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", output_path))?;

        Ok(())
    }
}
