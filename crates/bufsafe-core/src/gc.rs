//! Deferred reclamation for data shared with the audio thread
//!
//! Listener registries are published through `basedrop::SharedCell`. When the
//! audio thread drops the last reference to a retired registry, `basedrop`
//! only enqueues the pointer; the actual free happens here, on a background
//! thread that owns the `Collector`.
//!
//! Unlike a process-wide collector, a [`Reclaimer`] is an ordinary owned
//! value: every monitor holds one, and dropping it stops and joins the thread
//! after a final collection pass.

use basedrop::{Collector, Handle};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the collector thread wakes up
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Owns the thread that frees retired `Shared` allocations
pub struct Reclaimer {
    handle: Handle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Spawn a collector thread with the default interval
    pub fn spawn(name: &str) -> io::Result<Self> {
        Self::with_interval(name, DEFAULT_COLLECT_INTERVAL)
    }

    /// Spawn a collector thread that runs every `interval`
    pub fn with_interval(name: &str, interval: Duration) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_name = name.to_string();

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            // Collector is !Sync, so it lives and dies on this thread
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::debug!("Reclaimer thread '{}' started", thread_name);

            while !thread_stop.load(Ordering::Acquire) {
                collector.collect();
                thread::park_timeout(interval);
            }

            collector.collect();
            let pending = collector.alloc_count();
            if pending > 0 {
                log::debug!(
                    "Reclaimer thread '{}' exiting with {} live allocation(s)",
                    thread_name,
                    pending
                );
            }
        })?;

        let handle = rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "reclaimer thread exited before handing out its handle")
        })?;

        Ok(Self {
            handle,
            stop,
            thread: Some(thread),
        })
    }

    /// Handle for creating `Shared`/`SharedCell` values collected here
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Wake the thread for an immediate collection pass
    pub fn collect_now(&self) {
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("Reclaimer thread panicked");
            }
        }
    }
}
