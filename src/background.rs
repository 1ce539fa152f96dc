//! Background writer & auto-commit (§4.6).
//!
//! The writer thread itself only knows how to wait, wake, and delegate; all
//! the actual commit/compact decisions live behind [`StoreBackgroundOps`] so
//! this module can be unit tested without a real `Store`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreError;

/// The subset of store state/behavior the background writer needs to drive
/// `try_commit`/`compact` decisions, without owning the store itself.
pub trait StoreBackgroundOps: Send + Sync {
    fn is_closed(&self) -> bool;
    fn millis_since_last_commit(&self) -> u64;
    fn auto_commit_delay_ms(&self) -> u64;
    fn auto_compact_fill_rate(&self) -> u32;
    fn auto_commit_memory(&self) -> usize;

    /// Commit iff no other writer currently holds the single-writer slot.
    /// Returns whether a commit actually happened.
    fn try_commit(&self) -> Result<bool, StoreError>;

    /// Cumulative (reads, writes) issued against the backing device, used to
    /// detect whether the store is under active read/write load.
    fn device_io_counts(&self) -> (u64, u64);

    fn compact(&self, target_fill_rate: u32, write_bytes: usize) -> Result<(), StoreError>;

    /// Route an error caught on this thread through the caller's configured
    /// sink, if any. Default is a no-op for implementors (tests) that don't
    /// care; [`crate::Store`] overrides it to call `background_exception_handler`.
    fn handle_background_exception(&self, _err: &StoreError) {}
}

struct Signal {
    stop: Mutex<bool>,
    condvar: Condvar,
}

/// Owns the single background thread for a store. Dropping it without
/// calling [`BackgroundWriter::stop`] leaves the thread running detached,
/// mirroring the teacher's "explicit shutdown, not Drop-driven" convention
/// for long-lived worker threads.
pub struct BackgroundWriter {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
    started_by: std::thread::ThreadId,
}

impl BackgroundWriter {
    /// Start the writer thread, or return `None` if auto-commit is disabled
    /// (`delay == 0`) — matching "a single thread per store, started iff
    /// autoCommitDelay > 0 and the store is writable".
    pub fn start(ops: Arc<dyn StoreBackgroundOps>) -> Option<Self> {
        let delay = ops.auto_commit_delay_ms();
        if delay == 0 {
            return None;
        }
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let wait_ms = delay.max(10) / 10;
        let wait = Duration::from_millis(wait_ms.max(1));

        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("store-auto-commit".into())
            .spawn(move || run_loop(ops, thread_signal, wait))
            .expect("spawning the auto-commit thread should not fail");

        Some(Self {
            signal,
            handle: Some(handle),
            started_by: std::thread::current().id(),
        })
    }

    /// Signal the thread to exit and wait for it, unless called from the
    /// thread itself (self-join would deadlock) — matching "join unless the
    /// caller ... is the thread itself".
    pub fn stop(&mut self) {
        *self.signal.stop.lock().unwrap() = true;
        self.signal.condvar.notify_all();
        if std::thread::current().id() == self.started_by {
            return;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(ops: Arc<dyn StoreBackgroundOps>, signal: Arc<Signal>, wait: Duration) {
    let mut last_io = ops.device_io_counts();
    loop {
        let guard = signal.stop.lock().unwrap();
        let (guard, _timeout) = signal.condvar.wait_timeout(guard, wait).unwrap();
        if *guard {
            return;
        }
        drop(guard);

        if ops.is_closed() {
            return;
        }
        if ops.millis_since_last_commit() <= ops.auto_commit_delay_ms() {
            continue;
        }
        if let Err(e) = ops.try_commit() {
            warn!(error = %e, "auto-commit failed");
            ops.handle_background_exception(&e);
            continue;
        }
        debug!("auto-commit ran");

        let fill_target = ops.auto_compact_fill_rate();
        if fill_target == 0 {
            continue;
        }
        let io = ops.device_io_counts();
        let target = if io != last_io {
            (fill_target / 3).max(1)
        } else {
            fill_target
        };
        last_io = io;
        if let Err(e) = ops.compact(target, ops.auto_commit_memory()) {
            warn!(error = %e, "auto-compact failed");
            ops.handle_background_exception(&e);
        }
    }
}

/// `beforeWrite`: called from map mutation paths with the current unsaved
/// memory estimate. Returns whether `save_needed` should now be set.
pub fn before_write(ops: &dyn StoreBackgroundOps, unsaved_memory: usize) -> Result<bool, StoreError> {
    if unsaved_memory <= ops.auto_commit_memory() {
        return Ok(false);
    }
    if ops.auto_commit_delay_ms() > 0 {
        ops.try_commit()?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct MockOps {
        closed: AtomicBool,
        commits: AtomicU64,
        last_commit_ms_ago: AtomicU64,
        delay_ms: u64,
        compact_fill_rate: u32,
    }

    impl StoreBackgroundOps for MockOps {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
        fn millis_since_last_commit(&self) -> u64 {
            self.last_commit_ms_ago.load(Ordering::Acquire)
        }
        fn auto_commit_delay_ms(&self) -> u64 {
            self.delay_ms
        }
        fn auto_compact_fill_rate(&self) -> u32 {
            self.compact_fill_rate
        }
        fn auto_commit_memory(&self) -> usize {
            1024
        }
        fn try_commit(&self) -> Result<bool, StoreError> {
            self.commits.fetch_add(1, Ordering::AcqRel);
            self.last_commit_ms_ago.store(0, Ordering::Release);
            Ok(true)
        }
        fn device_io_counts(&self) -> (u64, u64) {
            (0, 0)
        }
        fn compact(&self, _target_fill_rate: u32, _write_bytes: usize) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn disabled_auto_commit_does_not_start_a_thread() {
        let ops = Arc::new(MockOps {
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            last_commit_ms_ago: AtomicU64::new(0),
            delay_ms: 0,
            compact_fill_rate: 0,
        });
        assert!(BackgroundWriter::start(ops).is_none());
    }

    #[test]
    fn writer_commits_after_delay_elapses() {
        let ops = Arc::new(MockOps {
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            last_commit_ms_ago: AtomicU64::new(1000),
            delay_ms: 5,
            compact_fill_rate: 0,
        });
        let mut writer = BackgroundWriter::start(ops.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        writer.stop();
        assert!(ops.commits.load(Ordering::Acquire) >= 1);
    }

    #[test]
    fn before_write_trips_try_commit_once_over_budget() {
        let ops = MockOps {
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            last_commit_ms_ago: AtomicU64::new(0),
            delay_ms: 100,
            compact_fill_rate: 0,
        };
        assert!(!before_write(&ops, 10).unwrap());
        assert!(before_write(&ops, 2000).unwrap());
        assert_eq!(ops.commits.load(Ordering::Acquire), 1);
    }
}
