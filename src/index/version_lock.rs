//! Version-stamped node locks.

use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit word combining a writer lock and a monotonic version.
///
/// Bit 0 is the lock bit; the upper 63 bits are the version. The single
/// legal way to change the version is [`unlock`](Self::unlock): its
/// fetch-add both clears the lock bit (which was 1) and increments the
/// version, and doubles as the release edge for every store made while
/// the lock was held.
///
/// Readers never block. They snapshot the whole word with
/// [`stable`](Self::stable), read the node, and accept the read only if
/// [`validate`](Self::validate) sees the identical word. Comparing the
/// whole word (lock bit included) means a writer that has locked but not
/// yet bumped the version still invalidates concurrent reads.
#[derive(Debug)]
pub struct VersionLock {
    word: AtomicU64,
}

const LOCK_BIT: u64 = 1;

impl VersionLock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Spins until the lock bit is acquired.
    pub fn lock(&self) {
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current & LOCK_BIT == 0
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current | LOCK_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// One acquisition attempt.
    pub fn try_lock(&self) -> bool {
        let current = self.word.load(Ordering::Relaxed);
        current & LOCK_BIT == 0
            && self
                .word
                .compare_exchange(
                    current,
                    current | LOCK_BIT,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    /// Releases the lock and bumps the version in one step.
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked version lock");
        self.word.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) & LOCK_BIT != 0
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.word.load(Ordering::Acquire) >> 1
    }

    /// Snapshot for an optimistic read: spins past writers, then returns
    /// the whole word.
    pub fn stable(&self) -> u64 {
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word & LOCK_BIT == 0 {
                return word;
            }
            std::hint::spin_loop();
        }
    }

    /// Whether the word still matches a [`stable`](Self::stable) snapshot.
    #[inline]
    pub fn validate(&self, snapshot: u64) -> bool {
        self.word.load(Ordering::Acquire) == snapshot
    }

    /// Forces the word back to the unlocked zero state; only for node
    /// initialization over raw memory.
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }
}

impl Default for VersionLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unlock_increments_version_by_one() {
        let lock = VersionLock::new();
        assert_eq!(lock.version(), 0);

        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();

        assert!(!lock.is_locked());
        assert_eq!(lock.version(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = VersionLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn validate_detects_writer_between_reads() {
        let lock = VersionLock::new();
        let snapshot = lock.stable();

        lock.lock();
        // The lock bit alone invalidates the snapshot.
        assert!(!lock.validate(snapshot));
        lock.unlock();

        assert!(!lock.validate(snapshot));
        assert!(lock.validate(lock.stable()));
    }

    #[test]
    fn versions_are_monotonic_under_contention() {
        let lock = Arc::new(VersionLock::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.lock();
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(lock.version(), 4000);
        assert!(!lock.is_locked());
    }
}
