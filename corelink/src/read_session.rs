//! Reactor-side bookkeeping for one pending call: the notify-vs-reclaim
//! protocol that arbitrates between the reactor (frame arrival) and
//! the timer thread (deadline expiry).
//!
//! A `ReadSession` is created holding exactly one *baseline* shared
//! count on its [`LifeCycleLock`], representing the timer service's
//! standing interest in it. The timer's scheduled closure releases
//! that share itself once it actually runs; the caller that schedules
//! it is responsible for releasing it directly on any path where the
//! closure is never invoked (post failure, schedule failure). A sync
//! caller adds and releases a second, independent share around its
//! wait, so the session cannot be reclaimed while it is about to
//! block on the latch.

use crate::error::SessionError;
use corelink_core::lifecycle::LifeCycleLock;
use corelink_proto::{ParserState, Protocol, RequestId, Response};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// What a completed call resolved to.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub error: SessionError,
    pub response: Option<Response>,
    /// The exact frame bytes handed to `parse_response`, kept around
    /// for callers (the heartbeat round trip) that need to inspect
    /// the raw wire frame rather than its parsed payload.
    pub raw_frame: Option<Vec<u8>>,
}

impl Outcome {
    pub fn ok(response: Response, raw_frame: Vec<u8>) -> Self {
        Self {
            error: SessionError::Ok,
            response: Some(response),
            raw_frame: Some(raw_frame),
        }
    }

    pub fn err(error: SessionError) -> Self {
        Self {
            error,
            response: None,
            raw_frame: None,
        }
    }
}

/// The possible notifiers.
pub enum NotifyInput {
    /// The reactor observed a complete frame for this session's id.
    Frame {
        framebytes: Vec<u8>,
        parser_state: Option<ParserState>,
    },
    /// The timer's deadline fired before any frame arrived.
    Timeout,
    /// The sender failed before a frame could ever arrive (write
    /// failure, socket lost after registration). Lets the caller
    /// route every completion, including this one, through the same
    /// notify-vs-reclaim protocol instead of racing a direct return
    /// against a late timer fire.
    Failed(SessionError),
}

type AsyncCallback = Box<dyn FnOnce(Outcome) + Send>;

enum Sink {
    Sync {
        latch: Mutex<Option<Outcome>>,
        cond: Condvar,
    },
    Async(Mutex<Option<AsyncCallback>>),
}

pub struct ReadSession {
    pub request_id: RequestId,
    pub submit_time_us: u64,
    pub expire_time_us: Option<u64>,
    protocol: Arc<dyn Protocol>,
    lock: LifeCycleLock,
    sink: Sink,
}

impl ReadSession {
    /// Construct a session for a synchronous call, taking the
    /// baseline share the timer service will hold.
    pub fn new_sync(
        request_id: RequestId,
        submit_time_us: u64,
        expire_time_us: Option<u64>,
        protocol: Arc<dyn Protocol>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            request_id,
            submit_time_us,
            expire_time_us,
            protocol,
            lock: LifeCycleLock::new(),
            sink: Sink::Sync {
                latch: Mutex::new(None),
                cond: Condvar::new(),
            },
        });
        session.lock.try_shared(); // baseline share, granted to the timer
        session
    }

    pub fn new_async(
        request_id: RequestId,
        submit_time_us: u64,
        expire_time_us: Option<u64>,
        protocol: Arc<dyn Protocol>,
        callback: AsyncCallback,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            request_id,
            submit_time_us,
            expire_time_us,
            protocol,
            lock: LifeCycleLock::new(),
            sink: Sink::Async(Mutex::new(Some(callback))),
        });
        session.lock.try_shared();
        session
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.sink, Sink::Sync { .. })
    }

    /// Taken by a synchronous caller before writing the request, so
    /// the session cannot be reclaimed out from under it while it is
    /// about to wait on the latch.
    pub fn add_caller_share(&self) -> bool {
        self.lock.try_shared()
    }

    pub fn release_caller_share(&self) {
        self.lock.release_shared();
    }

    pub fn release_baseline_share(&self) {
        self.lock.release_shared();
    }

    /// Wrap `self` in a guard that releases the baseline share exactly
    /// once when dropped, whether that happens because the timer
    /// closure ran to completion, was dropped unrun after a successful
    /// cancellation, or was dropped unrun because scheduling itself
    /// failed.
    pub fn baseline_guard(self: &Arc<Self>) -> BaselineShareGuard {
        BaselineShareGuard(Arc::clone(self))
    }

    /// Blocks until [`Self::notify`] has published an outcome, then
    /// returns it. Only valid on a sync session; the caller must
    /// already hold its own share via [`Self::add_caller_share`].
    pub fn wait_sync(&self) -> Outcome {
        match &self.sink {
            Sink::Sync { latch, cond } => {
                let mut guard = latch.lock();
                while guard.is_none() {
                    cond.wait(&mut guard);
                }
                guard.take().expect("latch observed non-empty")
            }
            Sink::Async(_) => unreachable!("wait_sync called on an async session"),
        }
    }

    /// Attempt to complete this session. Returns `true` if this call
    /// was the single winner.
    pub fn notify(self: &Arc<Self>, input: NotifyInput) -> bool {
        if !self.lock.try_shared() {
            trace!(request_id = self.request_id, "notify: lock unavailable, bail");
            return false;
        }
        if !self.lock.try_upgrade_non_reentrant() {
            self.lock.release_shared();
            trace!(request_id = self.request_id, "notify: lost the upgrade race");
            return false;
        }

        let outcome = self.build_outcome(input);

        match &self.sink {
            Sink::Async(slot) => {
                if let Some(callback) = slot.lock().take() {
                    callback(outcome);
                } else {
                    warn!(request_id = self.request_id, "async callback missing at notify time");
                }
                self.lock.release_shared();
            }
            Sink::Sync { latch, cond } => {
                *latch.lock() = Some(outcome);
                cond.notify_all();
                // Deliberately not releasing the transient share here:
                // it drains once the sync caller wakes and releases its
                // own caller share, at which point both are gone and
                // the reactor's reclaim sweep can free this session.
                self.lock.release_shared();
            }
        }

        true
    }

    fn build_outcome(&self, input: NotifyInput) -> Outcome {
        match input {
            NotifyInput::Timeout => Outcome::err(SessionError::ReadTimeout),
            NotifyInput::Failed(error) => Outcome::err(error),
            NotifyInput::Frame {
                framebytes,
                parser_state,
            } => match self.protocol.parse_response(&framebytes, parser_state) {
                Ok(response) => Outcome::ok(response, framebytes),
                Err(_) => Outcome::err(SessionError::ParseResponseFail),
            },
        }
    }

    /// Attempt the exclusive transition that proves no shared count
    /// remains, i.e. every notifier and the sync caller (if any) has
    /// released. Only the reactor's reclaim sweep calls this.
    pub fn try_reclaim(&self) -> bool {
        self.lock.try_exclusive()
    }

    pub fn record(&self) -> i32 {
        self.lock.record()
    }
}

/// Releases a `ReadSession`'s baseline share exactly once on drop,
/// regardless of which path disposes of it.
pub struct BaselineShareGuard(Arc<ReadSession>);

impl Drop for BaselineShareGuard {
    fn drop(&mut self) {
        self.0.release_baseline_share();
    }
}

pub fn now_us() -> u64 {
    corelink_core::timer::now_us()
}

pub static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_proto::bolt::BoltProtocol;
    use std::sync::Barrier;

    fn dummy_protocol() -> Arc<dyn Protocol> {
        Arc::new(BoltProtocol::new())
    }

    #[test]
    fn sync_notify_publishes_to_latch() {
        let session = ReadSession::new_sync(1, now_us(), None, dummy_protocol());
        assert!(session.add_caller_share());
        let won = session.notify(NotifyInput::Timeout);
        assert!(won);
        let outcome = session.wait_sync();
        assert_eq!(outcome.error, SessionError::ReadTimeout);
        session.release_caller_share();
        session.release_baseline_share();
        assert!(session.try_reclaim());
    }

    #[test]
    fn only_one_notify_wins_under_race() {
        let session = ReadSession::new_sync(1, now_us(), None, dummy_protocol());
        session.add_caller_share();
        let barrier = Arc::new(Barrier::new(2));
        let s1 = Arc::clone(&session);
        let b1 = Arc::clone(&barrier);
        let t1 = std::thread::spawn(move || {
            b1.wait();
            s1.notify(NotifyInput::Timeout)
        });
        let s2 = Arc::clone(&session);
        let b2 = Arc::clone(&barrier);
        let t2 = std::thread::spawn(move || {
            b2.wait();
            s2.notify(NotifyInput::Timeout)
        });
        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        assert_ne!(r1, r2, "exactly one notifier must win");
    }

    #[test]
    fn async_notify_invokes_callback_and_releases() {
        let (tx, rx) = std::sync::mpsc::channel();
        let session = ReadSession::new_async(
            1,
            now_us(),
            None,
            dummy_protocol(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome.error);
            }),
        );
        assert!(session.notify(NotifyInput::Timeout));
        assert_eq!(rx.recv().unwrap(), SessionError::ReadTimeout);
        session.release_baseline_share();
        assert!(session.try_reclaim());
    }

    #[test]
    fn reclaim_fails_while_shares_outstanding() {
        let session = ReadSession::new_sync(1, now_us(), None, dummy_protocol());
        session.add_caller_share();
        assert!(!session.try_reclaim(), "baseline + caller shares still held");
    }
}
