//! Watchdog enforcing the guest computation budget
//!
//! The watchdog thread samples the session once per tick and only counts
//! ticks during which no capability call is in flight. When the accumulated
//! guest time exceeds the budget it raises the interrupt flag polled by the
//! interpreter, exactly once, and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Marks the session as blocked inside a capability call
#[derive(Debug, Clone, Default)]
pub struct CallMarker {
    active: Arc<AtomicBool>,
}

impl CallMarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag until the returned guard drops, even on unwind
    pub fn enter(&self) -> CallGuard<'_> {
        self.active.store(true, Ordering::SeqCst);
        CallGuard { marker: self }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Clears the capability-call flag on drop
#[derive(Debug)]
pub struct CallGuard<'a> {
    marker: &'a CallMarker,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.marker.active.store(false, Ordering::SeqCst);
    }
}

const MIN_TICK: Duration = Duration::from_millis(1);

struct Shared {
    /// Set by the session once evaluation returned; guards the interrupt
    done: Mutex<bool>,
    interrupt: Arc<AtomicBool>,
    fired: AtomicBool,
}

/// Supervises one evaluation. Always joined before the evaluation's caller
/// gets control back, either by [`Watchdog::finish`] or on drop.
pub struct Watchdog {
    shared: Arc<Shared>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start supervising.
    ///
    /// `interrupt` is the flag the interpreter's interrupt hook reads. Ticks
    /// shorter than a millisecond are raised to one.
    pub fn start(
        timeout: Duration,
        tick: Duration,
        calls: CallMarker,
        interrupt: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let tick = tick.max(MIN_TICK);
        let shared = Arc::new(Shared {
            done: Mutex::new(false),
            interrupt,
            fired: AtomicBool::new(false),
        });
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("toolvault-watchdog".to_string())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    // not accurate, but reasonable enough for a timeout
                    if !calls.is_active() {
                        elapsed += tick;
                    }

                    if elapsed > timeout {
                        let done = thread_shared
                            .done
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        if !*done {
                            tracing::warn!(
                                timeout_ms = timeout.as_millis() as u64,
                                "watchdog interrupting guest script"
                            );
                            thread_shared.fired.store(true, Ordering::SeqCst);
                            thread_shared.interrupt.store(true, Ordering::SeqCst);
                        }
                        break;
                    }
                }
            })?;

        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop and join the watchdog; returns whether it interrupted the guest
    pub fn finish(mut self) -> bool {
        self.stop();
        self.shared.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        {
            let mut done = self
                .shared
                .done
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *done = true;
        }

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
