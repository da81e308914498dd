//! Three-state intent lock (shared / upgraded / exclusive).
//!
//! Used wherever ownership of a resource must move safely between two
//! independent producers without a reference count alone being able to
//! answer "is anyone still touching this". See the notify-vs-reclaim
//! protocol between the reactor and the timer thread for the canonical
//! use: [`LifeCycleLock`] arbitrates which of them gets to complete a
//! pending call, and a later exclusive transition proves nobody else is
//! still holding a share before the resource is freed.

use std::sync::atomic::{AtomicI32, Ordering};

const SHARED: i32 = 4;
const UPGRADED: i32 = 2;
const EXCLUSIVE: i32 = 1;

/// A lock with three non-exclusive-with-each-other intents.
///
/// Any number of holders may hold a *shared* count at once. At most one
/// holder may be *upgraded* at a time, and an upgraded holder blocks new
/// shared acquisitions. An upgraded holder transitions to *exclusive*
/// only once every shared count has drained, which is the signal that
/// it is safe to free the guarded resource.
#[derive(Debug, Default)]
pub struct LifeCycleLock {
    bits: AtomicI32,
}

impl LifeCycleLock {
    pub fn new() -> Self {
        Self {
            bits: AtomicI32::new(0),
        }
    }

    /// Attempt to take a shared count. Fails if the lock is upgraded or
    /// exclusive.
    pub fn try_shared(&self) -> bool {
        let value = self.bits.fetch_add(SHARED, Ordering::AcqRel);
        if value & (UPGRADED | EXCLUSIVE) != 0 {
            self.bits.fetch_add(-SHARED, Ordering::Release);
            return false;
        }
        true
    }

    /// Spin until a shared count is granted.
    pub fn shared(&self) {
        let mut spins = 0u64;
        while !self.try_shared() {
            spins += 1;
            if spins > 1000 {
                spins = 0;
                std::thread::yield_now();
            }
        }
    }

    /// Try to set the upgraded bit. Succeeds even if another holder is
    /// already upgraded (re-entrant) as long as nobody holds exclusive.
    pub fn try_upgrade(&self) -> bool {
        let value = self.bits.fetch_or(UPGRADED, Ordering::AcqRel);
        value & EXCLUSIVE == 0
    }

    /// Like [`Self::try_upgrade`] but fails if anyone (including the
    /// caller's own earlier call) already holds upgraded or exclusive.
    /// This is the single-winner primitive the notify protocol relies on.
    pub fn try_upgrade_non_reentrant(&self) -> bool {
        let value = self.bits.fetch_or(UPGRADED, Ordering::AcqRel);
        value & (UPGRADED | EXCLUSIVE) == 0
    }

    /// Spin until upgraded (re-entrant).
    pub fn upgrade(&self) {
        let mut spins = 0u64;
        while !self.try_upgrade() {
            spins += 1;
            if spins > 1000 {
                spins = 0;
                std::thread::yield_now();
            }
        }
    }

    /// Atomically flip upgraded -> exclusive. Only succeeds when the bit
    /// pattern is exactly `UPGRADED` (no shared counts, not already
    /// exclusive), proving nobody else holds a reference.
    pub fn try_exclusive(&self) -> bool {
        self.bits
            .compare_exchange(
                UPGRADED,
                EXCLUSIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn exclusive(&self) {
        let mut spins = 0u64;
        while !self.try_exclusive() {
            spins += 1;
            if spins > 1000 {
                spins = 0;
                std::thread::yield_now();
            }
        }
    }

    pub fn release_shared(&self) {
        self.bits.fetch_add(-SHARED, Ordering::Release);
    }

    pub fn release_exclusive(&self) {
        self.bits
            .fetch_and(!(EXCLUSIVE | UPGRADED), Ordering::Release);
    }

    pub fn record(&self) -> i32 {
        self.bits.load(Ordering::Acquire)
    }
}

/// RAII guard taking a shared count for the lifetime of the guard.
pub struct LifeCycleShareGuard<'a> {
    lock: &'a LifeCycleLock,
    shared: bool,
}

impl<'a> LifeCycleShareGuard<'a> {
    pub fn new(lock: &'a LifeCycleLock) -> Self {
        let shared = lock.try_shared();
        Self { lock, shared }
    }

    pub fn shared(&self) -> bool {
        self.shared
    }
}

impl Drop for LifeCycleShareGuard<'_> {
    fn drop(&mut self) {
        if self.shared {
            self.lock.release_shared();
        }
    }
}
