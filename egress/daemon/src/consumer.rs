//! Event consumption
//!
//! Drains the connection-opened stream until its reader is closed. A single
//! bad record, failed lookup or transient read error never ends the loop.

use crate::{
    allow::{AllowList, AllowManager},
    events::{PerfReader, ReadError},
    reporter::Reporter,
    resolver::{names_or_sentinel, Resolver},
    types::{decode_ip4_event, Connection},
};
use log::{debug, error, info, warn};

/// Counters for one consumer run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Records decoded and processed
    pub processed: u64,
    /// Records skipped because they did not decode
    pub malformed: u64,
    /// Reads that failed with something other than "closed"
    pub read_errors: u64,
}

/// Processes connection-opened events
pub struct EventConsumer<'a, A, R> {
    allow: &'a mut AllowManager<A>,
    resolver: &'a R,
    reporter: &'a mut Reporter,
}

impl<'a, A: AllowList, R: Resolver> EventConsumer<'a, A, R> {
    pub fn new(allow: &'a mut AllowManager<A>, resolver: &'a R, reporter: &'a mut Reporter) -> Self {
        Self {
            allow,
            resolver,
            reporter,
        }
    }

    /// Read until the reader is closed
    pub async fn run(&mut self, reader: &mut PerfReader) -> ConsumerStats {
        let mut stats = ConsumerStats::default();

        loop {
            let raw = match reader.read().await {
                Ok(raw) => raw,
                Err(ReadError::Closed) => break,
                Err(e) => {
                    error!("reading from perf event reader: {}", e);
                    stats.read_errors += 1;
                    continue;
                }
            };

            let event = match decode_ip4_event(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("parsing perf event: {}", e);
                    stats.malformed += 1;
                    continue;
                }
            };

            self.handle(&Connection::from(&event)).await;
            stats.processed += 1;
        }

        info!(
            "{} closed: {} processed, {} malformed, {} read error(s)",
            reader.name(),
            stats.processed,
            stats.malformed,
            stats.read_errors
        );
        stats
    }

    async fn handle(&mut self, conn: &Connection) {
        let domains = names_or_sentinel(self.resolver, conn.daddr).await;
        let allowed = self.allow.observe(conn.daddr, &domains);
        self.reporter.record(conn, &domains, allowed);

        info!(
            "[{}]{:<16} -> {:<15} ({}) {:<6}",
            conn.pid,
            conn.task,
            conn.daddr.to_string(),
            domains.join(", "),
            conn.dport
        );
    }
}

/// Consume the connection-closed stream until its reader is closed
///
/// Records are only counted; keeping the stream drained stops the kernel
/// side from backing up.
pub async fn drain(mut reader: PerfReader) -> u64 {
    let mut drained = 0u64;
    loop {
        match reader.read().await {
            Ok(raw) => {
                drained += 1;
                if let Ok(event) = decode_ip4_event(&raw) {
                    debug!("connection closed: {}", Connection::from(&event));
                }
            }
            Err(ReadError::Closed) => break,
            Err(e) => debug!("reading from {}: {}", reader.name(), e),
        }
    }
    debug!("{} drained {} record(s)", reader.name(), drained);
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::Record,
        testing::{MemoryAllowList, StaticResolver},
        types::{addr_to_key, encode_ip4_event, Event, IP4Event},
    };
    use aya::maps::perf::PerfBufferError;
    use kntrl_common::AF_INET;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn raw_event(pid: u32, task: &[u8], addr: Ipv4Addr, dport: u16) -> Vec<u8> {
        let mut name = [0u8; 16];
        name[..task.len()].copy_from_slice(task);
        encode_ip4_event(&IP4Event {
            event: Event {
                ts_us: 10,
                pid,
                af: AF_INET,
                task: name,
            },
            daddr: addr_to_key(addr),
            dport,
        })
        .to_vec()
    }

    fn github() -> Ipv4Addr {
        Ipv4Addr::new(140, 82, 112, 3)
    }

    fn setup() -> (AllowManager<MemoryAllowList>, StaticResolver, Reporter) {
        let allow = AllowManager::new(
            MemoryAllowList::default(),
            vec![".github.com".to_string(), ".kondukto.io".to_string()],
        );
        let resolver =
            StaticResolver::default().with_reverse(github(), "lb-140-82-112-3-iad.github.com.");
        (allow, resolver, Reporter::new(None).unwrap())
    }

    async fn feed(tx: &mpsc::Sender<Record>, records: Vec<Record>) {
        for record in records {
            tx.send(record).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_loop_survives_bad_records_and_read_errors() {
        let (mut allow, resolver, mut reporter) = setup();
        let (tx, mut reader) = PerfReader::channel("ipv4_events", 16);

        feed(
            &tx,
            vec![
                Ok(vec![0u8; 12]),
                Err(ReadError::Buffer {
                    cpu: 0,
                    source: PerfBufferError::NoBuffers,
                }),
                Ok(raw_event(7, b"curl", Ipv4Addr::new(93, 184, 216, 34), 80)),
            ],
        )
        .await;
        drop(tx);

        let stats = EventConsumer::new(&mut allow, &resolver, &mut reporter)
            .run(&mut reader)
            .await;

        assert_eq!(
            stats,
            ConsumerStats {
                processed: 1,
                malformed: 1,
                read_errors: 1
            }
        );
        assert_eq!(reporter.event_count(), 1);
        assert_eq!(allow.list().len(), 0);
    }

    #[tokio::test]
    async fn test_matching_destination_is_allowed_once() {
        let (mut allow, resolver, mut reporter) = setup();
        let (tx, mut reader) = PerfReader::channel("ipv4_events", 16);

        let event = raw_event(42, b"git", github(), 443);
        feed(&tx, vec![Ok(event.clone()), Ok(event)]).await;
        drop(tx);

        let stats = EventConsumer::new(&mut allow, &resolver, &mut reporter)
            .run(&mut reader)
            .await;

        assert_eq!(stats.processed, 2);
        assert_eq!(allow.list().len(), 1);
        assert_eq!(allow.list().lookup(github()).unwrap(), Some(1));
        assert_eq!(allow.extended(), 1);

        let summary = reporter.summary();
        assert_eq!(summary.connections.len(), 1);
        assert_eq!(summary.connections[0].connections, 2);
        assert!(summary.connections[0].allowed);
    }

    #[tokio::test]
    async fn test_close_ends_blocked_loop() {
        let (mut allow, resolver, mut reporter) = setup();
        let (tx, mut reader) = PerfReader::channel("ipv4_events", 16);
        let closer = reader.closer();

        tx.send(Ok(raw_event(1, b"nc", Ipv4Addr::new(10, 1, 1, 1), 22)))
            .await
            .unwrap();

        let closing = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            closer.close();
        });

        let stats = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            EventConsumer::new(&mut allow, &resolver, &mut reporter).run(&mut reader),
        )
        .await
        .expect("loop did not stop after close");

        closing.await.unwrap();
        assert_eq!(stats.processed, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_drain_counts_until_closed() {
        let (tx, reader) = PerfReader::channel("ipv4_closed_events", 16);
        let closer = reader.closer();
        feed(
            &tx,
            vec![
                Ok(raw_event(1, b"curl", github(), 443)),
                Ok(vec![1, 2, 3]),
            ],
        )
        .await;

        let handle = tokio::spawn(drain(reader));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        closer.close();

        assert_eq!(handle.await.unwrap(), 2);
    }
}
