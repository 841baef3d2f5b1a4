//! Event streams from eBPF perf buffers
//!
//! Each perf event array is read by one task per CPU. The tasks funnel raw
//! samples into a single bounded channel so the consumer sees one ordered
//! stream per map. Closing a [`PerfReader`] stops its CPU tasks and makes
//! every pending and future `read` return [`ReadError::Closed`].

use crate::error::EngineError;
use aya::{
    maps::{
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer, PerfBufferError},
        Map, MapData,
    },
    util::online_cpus,
};
use bytes::BytesMut;
use kntrl_common::IP4Event;
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Samples buffered between the CPU tasks and the consumer
pub const CHANNEL_CAPACITY: usize = 1024;

/// Buffers handed to each `read_events` call
const READ_BATCH: usize = 16;

/// One raw sample, or the error a CPU task hit while reading
pub type Record = Result<Vec<u8>, ReadError>;

/// Outcome of a failed read
#[derive(Debug, Error)]
pub enum ReadError {
    /// The reader was closed; the normal end of a stream
    #[error("perf reader closed")]
    Closed,

    #[error("reading perf buffer on CPU {cpu}: {source}")]
    Buffer {
        cpu: u32,
        #[source]
        source: PerfBufferError,
    },
}

/// Handle that closes a [`PerfReader`] from another task
#[derive(Clone)]
pub struct ReaderCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl ReaderCloser {
    /// Close the reader. Closing twice is a no-op.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the reader has been closed
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for only ends once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Closable stream of raw samples from one perf event array
pub struct PerfReader {
    name: &'static str,
    rx: mpsc::Receiver<Record>,
    closed: watch::Receiver<bool>,
    closer: ReaderCloser,
    tasks: Vec<JoinHandle<()>>,
}

impl PerfReader {
    /// A reader fed through the returned sender
    pub fn channel(name: &'static str, capacity: usize) -> (mpsc::Sender<Record>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed_tx, closed) = watch::channel(false);
        let reader = Self {
            name,
            rx,
            closed,
            closer: ReaderCloser {
                tx: Arc::new(closed_tx),
            },
            tasks: Vec::new(),
        };
        (tx, reader)
    }

    /// Open `map` as a perf event array and spawn one reader task per CPU
    ///
    /// # Arguments
    ///
    /// * `name` - Map name, used in logs and errors
    /// * `map` - Perf event array taken from the collection
    /// * `buffer_bytes` - Requested per-CPU buffer size
    pub fn open(name: &'static str, map: Map, buffer_bytes: usize) -> Result<Self, EngineError> {
        let perf_err = |source: Box<dyn std::error::Error + Send + Sync>| EngineError::PerfReader {
            map: name,
            source,
        };

        let mut perf_array: AsyncPerfEventArray<MapData> =
            AsyncPerfEventArray::try_from(map).map_err(|e| perf_err(Box::new(e)))?;
        let cpus =
            online_cpus().map_err(|e| perf_err(format!("online_cpus failed: {:?}", e).into()))?;
        let pages = page_count(buffer_bytes);

        let (tx, mut reader) = Self::channel(name, CHANNEL_CAPACITY);
        info!("Opening {} on {} CPUs ({} page(s) each)", name, cpus.len(), pages);

        for cpu in cpus {
            let buf = perf_array
                .open(cpu, Some(pages))
                .map_err(|e| perf_err(Box::new(e)))?;
            let task = tokio::spawn(pump(name, cpu, buf, tx.clone(), reader.closed.clone()));
            reader.tasks.push(task);
        }

        Ok(reader)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn closer(&self) -> ReaderCloser {
        self.closer.clone()
    }

    pub fn close(&self) {
        self.closer.close();
    }

    /// Next raw sample
    ///
    /// Blocks until a sample arrives or the reader is closed. Once closed,
    /// every call returns [`ReadError::Closed`].
    pub async fn read(&mut self) -> Record {
        if *self.closed.borrow() {
            return Err(ReadError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => Err(ReadError::Closed),
            record = self.rx.recv() => record.unwrap_or(Err(ReadError::Closed)),
        }
    }
}

impl Drop for PerfReader {
    fn drop(&mut self) {
        self.closer.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Move samples from one CPU's perf buffer into the reader channel
async fn pump(
    name: &'static str,
    cpu: u32,
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Record>,
    mut closed: watch::Receiver<bool>,
) {
    // Pre-allocate buffers for reading events
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(IP4Event::SIZE))
        .collect::<Vec<_>>();

    loop {
        let result = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            result = buf.read_events(&mut buffers) => result,
        };

        let record_batch: Vec<Record> = match result {
            Ok(events) => {
                if events.lost > 0 {
                    warn!("{}: lost {} sample(s) on CPU {}", name, events.lost, cpu);
                }
                buffers
                    .iter_mut()
                    .take(events.read)
                    .map(|b| {
                        let sample = b.to_vec();
                        b.clear();
                        Ok(sample)
                    })
                    .collect()
            }
            Err(source) => vec![Err(ReadError::Buffer { cpu, source })],
        };

        for record in record_batch {
            if tx.send(record).await.is_err() {
                return;
            }
        }
    }

    debug!("{}: reader for CPU {} stopped", name, cpu);
}

/// Pages per CPU buffer for a requested byte size (power of two, at least one)
pub fn page_count(buffer_bytes: usize) -> usize {
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as usize } else { 4096 };
    buffer_bytes.div_ceil(page_size).max(1).next_power_of_two()
}
