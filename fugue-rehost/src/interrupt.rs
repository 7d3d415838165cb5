//! interrupt delivery
//! 
//! pending interrupts accumulate in a shared queue when replay enters a state
//! that carries interrupts; an interrupter delivers a single irq to the host
//! on its own schedule, independently of replay.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::types::Irq;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot inject interrupt {0}: {1}")]
    Host(Irq, #[source] anyhow::Error),
    #[error("cannot spawn interrupter for interrupt {0}: {1}")]
    Spawn(Irq, #[source] std::io::Error),
}

impl Error {
    pub fn host<E>(irq: Irq, e: E) -> Self
    where E: std::error::Error + Send + Sync + 'static {
        Self::Host(irq, anyhow::Error::new(e))
    }
}

/// something that can receive an interrupt, e.g., an emulator's interrupt
/// controller
pub trait InterruptHost: Send + Sync {
    fn inject(&self, irq: Irq) -> Result<(), Error>;
}

/// pending interrupts and their multiplicity
#[derive(Clone, Debug, Default)]
pub struct InterruptQueue(Arc<Mutex<BTreeMap<Irq, u32>>>);

impl InterruptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, irq: Irq, count: u32) {
        if count == 0 {
            return
        }
        *self.0.lock().entry(irq).or_default() += count;
    }

    pub fn extend<'a>(&self, interrupts: impl IntoIterator<Item = (&'a Irq, &'a u32)>) {
        let mut queue = self.0.lock();
        for (irq, count) in interrupts.into_iter().filter(|(_, count)| **count > 0) {
            *queue.entry(*irq).or_default() += *count;
        }
    }

    /// take everything queued since the last drain
    pub fn drain(&self) -> BTreeMap<Irq, u32> {
        std::mem::take(&mut *self.0.lock())
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl InterruptHost for InterruptQueue {
    fn inject(&self, irq: Irq) -> Result<(), Error> {
        self.push(irq, 1);
        Ok(())
    }
}

/// handle to a running interrupter thread
/// 
/// the thread injects `irq` into its host, then waits one interval for a
/// shutdown signal before injecting again. it stops when its count is
/// exhausted, when signalled, or when the host refuses an injection.
/// dropping the handle signals shutdown without waiting.
pub struct Interrupter {
    irq: Irq,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<usize>>,
}

impl Interrupter {
    /// inject `irq` `count` times (or until shut down if `None`), `interval`
    /// apart
    pub fn spawn(
        irq: Irq,
        host: Arc<dyn InterruptHost>,
        count: Option<usize>,
        interval: Duration,
    ) -> Result<Self, Error> {
        let (shutdown, signal) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(format!("interrupter-{}", irq))
            .spawn(move || {
                let mut injected = 0;
                loop {
                    if count.map(|n| injected >= n).unwrap_or(false) {
                        break
                    }

                    if let Err(e) = host.inject(irq) {
                        log::warn!("{}", e);
                        break
                    }
                    injected += 1;
                    log::trace!("injected interrupt {} ({} so far)", irq, injected);

                    if count.map(|n| injected >= n).unwrap_or(false) {
                        break
                    }

                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                injected
            })
            .map_err(|e| Error::Spawn(irq, e))?;

        Ok(Self {
            irq,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn irq(&self) -> Irq {
        self.irq
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// ask the thread to stop after its current injection
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// wait for the thread; returns the number of injections it made
    pub fn join(mut self) -> usize {
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
