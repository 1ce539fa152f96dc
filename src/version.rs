//! Versioning & snapshot gating (§4.5): `TxCounter`-pinned reader
//! registration, the FIFO of drained-but-not-yet-forgotten versions, and the
//! monotonically advancing `oldest_version_to_keep` that drives reclamation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Slot {
    version: u64,
    count: AtomicI64,
}

/// A registered pin against a store version. Holding one guarantees that
/// `oldest_version_to_keep` will never advance past `version` while it's
/// alive. Must be returned via [`VersionRegistry::deregister`].
pub struct TxCounter {
    slot: Arc<Slot>,
}

impl TxCounter {
    pub fn version(&self) -> u64 {
        self.slot.version
    }
}

pub struct VersionRegistry {
    current: Mutex<Arc<Slot>>,
    fifo: Mutex<VecDeque<Arc<Slot>>>,
    oldest_version_to_keep: AtomicU64,
}

impl VersionRegistry {
    pub fn new(initial_version: u64) -> Self {
        Self {
            current: Mutex::new(Arc::new(Slot {
                version: initial_version,
                count: AtomicI64::new(0),
            })),
            fifo: Mutex::new(VecDeque::new()),
            oldest_version_to_keep: AtomicU64::new(initial_version),
        }
    }

    pub fn oldest_version_to_keep(&self) -> u64 {
        self.oldest_version_to_keep.load(Ordering::Acquire)
    }

    pub fn current_version(&self) -> u64 {
        self.current.lock().unwrap().version
    }

    /// Pin the version that is current *right now*. Retries if it raced with
    /// a concurrent drain that pushed the counter negative, per the "counter
    /// CAS subtlety" in §4.5: an increment that observes a negative
    /// post-value must undo itself and re-read the current slot.
    pub fn register_version_usage(&self) -> TxCounter {
        loop {
            let slot = self.current.lock().unwrap().clone();
            let observed = slot.count.fetch_add(1, Ordering::AcqRel) + 1;
            if observed < 0 {
                slot.count.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            return TxCounter { slot };
        }
    }

    pub fn deregister_version_usage(&self, handle: TxCounter) {
        let remaining = handle.slot.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            self.try_drop_unused_versions();
        }
    }

    /// Called by the commit pipeline when `current_version` advances: the
    /// old slot is pushed onto the FIFO, a fresh counter is installed for the
    /// new version, and the old slot is decremented once to release the
    /// store's own implicit reference.
    pub fn advance_version(&self, new_version: u64) {
        let old_slot = {
            let mut current = self.current.lock().unwrap();
            let old = current.clone();
            *current = Arc::new(Slot {
                version: new_version,
                count: AtomicI64::new(0),
            });
            old
        };
        self.fifo.lock().unwrap().push_back(old_slot.clone());
        let remaining = old_slot.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            self.try_drop_unused_versions();
        }
    }

    /// Peel fully-drained counters (value < 0, the sentinel meaning "no
    /// readers ever will pin this again") from the head of the FIFO, then
    /// CAS-advance `oldest_version_to_keep` to the new front (or to the
    /// current version if the FIFO emptied out).
    pub fn try_drop_unused_versions(&self) {
        let new_oldest = {
            let mut fifo = self.fifo.lock().unwrap();
            while let Some(front) = fifo.front() {
                if front.count.load(Ordering::Acquire) < 0 {
                    fifo.pop_front();
                } else {
                    break;
                }
            }
            match fifo.front() {
                Some(front) => front.version,
                None => self.current.lock().unwrap().version,
            }
        };
        loop {
            let cur = self.oldest_version_to_keep.load(Ordering::Acquire);
            if new_oldest <= cur {
                return;
            }
            if self
                .oldest_version_to_keep
                .compare_exchange(cur, new_oldest, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn reset(&self, version: u64) {
        *self.current.lock().unwrap() = Arc::new(Slot {
            version,
            count: AtomicI64::new(0),
        });
        self.fifo.lock().unwrap().clear();
        self.oldest_version_to_keep.store(version, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_version_advances_once_readers_drop() {
        let reg = VersionRegistry::new(5);
        let handle = reg.register_version_usage();
        assert_eq!(handle.version(), 5);
        reg.advance_version(6);
        reg.advance_version(7);
        // Old readers on v5 still pin the watermark.
        assert_eq!(reg.oldest_version_to_keep(), 5);
        reg.deregister_version_usage(handle);
        assert!(reg.oldest_version_to_keep() >= 6);
    }

    #[test]
    fn oldest_version_to_keep_never_goes_backwards() {
        let reg = VersionRegistry::new(0);
        reg.advance_version(1);
        reg.advance_version(2);
        let before = reg.oldest_version_to_keep();
        reg.try_drop_unused_versions();
        assert!(reg.oldest_version_to_keep() >= before);
    }

    #[test]
    fn register_after_many_advances_pins_current() {
        let reg = VersionRegistry::new(0);
        for v in 1..5 {
            reg.advance_version(v);
        }
        let handle = reg.register_version_usage();
        assert_eq!(handle.version(), 4);
    }
}
