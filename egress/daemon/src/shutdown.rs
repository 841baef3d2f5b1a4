//! Shutdown coordination
//!
//! A termination signal closes the connection-opened reader, which is what
//! ends the event loop. The coordinator then posts once on a completion
//! channel; finalization waits on it before tearing anything down.

use crate::{error::EngineError, events::ReaderCloser};
use log::{info, warn};
use std::future::Future;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::oneshot,
    task::JoinHandle,
};

/// Why the coordinator fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal(&'static str),
    /// The reader was closed by something other than a signal
    ReaderClosed,
}

/// Completion side of an armed coordinator
pub struct ShutdownHandle {
    done: oneshot::Receiver<ShutdownCause>,
    task: JoinHandle<()>,
}

impl ShutdownHandle {
    /// Wait for the coordinator to finish closing the reader
    pub async fn wait(self) -> ShutdownCause {
        match self.done.await {
            Ok(cause) => cause,
            Err(_) => {
                warn!("shutdown coordinator exited without completing");
                ShutdownCause::ReaderClosed
            }
        }
    }

    /// Stop the coordinator without waiting
    pub fn disarm(self) {
        self.task.abort();
    }
}

pub struct ShutdownCoordinator;

impl ShutdownCoordinator {
    /// Arm on SIGINT, SIGTERM, SIGQUIT and SIGHUP
    ///
    /// SIGKILL cannot be handled by any process and is not registered.
    pub fn arm_signals(closer: ReaderCloser) -> Result<ShutdownHandle, EngineError> {
        let mut interrupt = signal(SignalKind::interrupt()).map_err(EngineError::Signal)?;
        let mut terminate = signal(SignalKind::terminate()).map_err(EngineError::Signal)?;
        let mut quit = signal(SignalKind::quit()).map_err(EngineError::Signal)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(EngineError::Signal)?;

        let trigger = async move {
            tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = quit.recv() => "SIGQUIT",
                _ = hangup.recv() => "SIGHUP",
            }
        };

        Ok(Self::arm(closer, trigger))
    }

    /// Arm on an arbitrary trigger future
    ///
    /// The coordinator fires once, on the trigger or when the reader is
    /// closed elsewhere, whichever comes first.
    pub fn arm<F>(closer: ReaderCloser, trigger: F) -> ShutdownHandle
    where
        F: Future<Output = &'static str> + Send + 'static,
    {
        let (done_tx, done) = oneshot::channel();

        let task = tokio::spawn(async move {
            let cause = tokio::select! {
                name = trigger => ShutdownCause::Signal(name),
                _ = closer.closed() => ShutdownCause::ReaderClosed,
            };

            if let ShutdownCause::Signal(name) = cause {
                info!("received {}, shutting down...", name);
            }
            closer.close();
            let _ = done_tx.send(cause);
        });

        ShutdownHandle { done, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PerfReader, ReadError};
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_closes_reader() {
        let (_tx, mut reader) = PerfReader::channel("ipv4_events", 4);
        let (fire, fired) = oneshot::channel::<()>();
        let handle = ShutdownCoordinator::arm(reader.closer(), async move {
            let _ = fired.await;
            "SIGTERM"
        });

        let pending = tokio::spawn(async move { reader.read().await });
        fire.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReadError::Closed)));
        assert_eq!(handle.wait().await, ShutdownCause::Signal("SIGTERM"));
    }

    #[tokio::test]
    async fn test_concurrent_closes_complete_once() {
        let (_tx, reader) = PerfReader::channel("ipv4_events", 4);
        let closer = reader.closer();
        let handle = ShutdownCoordinator::arm(closer.clone(), std::future::pending());

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let closer = closer.clone();
                tokio::spawn(async move { closer.close() })
            })
            .collect();
        for c in closers {
            c.await.unwrap();
        }

        let cause = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap();
        assert_eq!(cause, ShutdownCause::ReaderClosed);
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_arm_signals_registers() {
        let (_tx, reader) = PerfReader::channel("ipv4_events", 4);
        let handle = ShutdownCoordinator::arm_signals(reader.closer()).unwrap();
        handle.disarm();
    }
}
