//! Fire a batch of requests over one Channel and wait for every leg to
//! settle: `PipelineSession::new().pipe(req).pipe(req).to(channel)
//! .sync()`.

use crate::channel::Channel;
use crate::error::SessionError;
use crate::session::Session;
use corelink_proto::{Request, Response};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One leg's outcome, kept in submission order.
pub type LegResult = Result<Response, SessionError>;

struct Barrier {
    remaining: AtomicUsize,
    done: Mutex<bool>,
    cond: Condvar,
}

impl Barrier {
    fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            done: Mutex::new(count == 0),
            cond: Condvar::new(),
        }
    }

    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.done.lock() = true;
            self.cond.notify_all();
        }
    }

    /// Waits up to `timeout_ms` for every leg to complete. Returns
    /// `true` if all legs settled before the deadline.
    fn wait(&self, timeout_ms: i64) -> bool {
        let mut guard = self.done.lock();
        if *guard {
            return true;
        }
        if timeout_ms <= 0 {
            self.cond.wait(&mut guard);
            return true;
        }
        let deadline = std::time::Duration::from_millis(timeout_ms as u64);
        let result = self.cond.wait_for(&mut guard, deadline);
        *guard || !result.timed_out()
    }
}

/// A batch of requests bound to one Channel, run concurrently and
/// joined. Each leg gets its own [`Session`], so retries, timeouts and
/// the notify-vs-reclaim protocol are exactly the single-request path;
/// this only adds the join barrier and the aggregated diagnostic.
pub struct PipelineSession {
    requests: Vec<Request>,
    channel: Option<Arc<Channel>>,
    timeout_ms: Option<i64>,
}

impl Default for PipelineSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineSession {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            channel: None,
            timeout_ms: None,
        }
    }

    /// Queue one leg. The matching `Response` comes back from
    /// [`Self::sync`], in the same position as this call.
    pub fn pipe(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    pub fn to(mut self, channel: Arc<Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Dispatch every leg as an async send under one shared barrier,
    /// then block for all of them (or the effective timeout). Returns
    /// one result per leg, in submission order, plus an aggregated
    /// diagnostic naming every leg that did not succeed.
    pub fn sync(self) -> (Vec<LegResult>, Option<String>) {
        let Some(channel) = self.channel else {
            let err = Err(SessionError::ProtocolNotFound);
            return (vec![err; self.requests.len().max(1)], Some("no channel bound".to_string()));
        };
        let timeout_ms = self.timeout_ms.unwrap_or(channel.options().timeout_ms);
        let count = self.requests.len();
        if count == 0 {
            return (Vec::new(), None);
        }

        let barrier = Arc::new(Barrier::new(count));
        let slots: Arc<Vec<Mutex<Option<LegResult>>>> =
            Arc::new((0..count).map(|_| Mutex::new(None)).collect());

        for (index, request) in self.requests.into_iter().enumerate() {
            let barrier = Arc::clone(&barrier);
            let slots = Arc::clone(&slots);
            let session = Session::send(request).to(Arc::clone(&channel)).timeout_ms(timeout_ms);
            if let Err(err) = session.send_async(move |result| {
                *slots[index].lock() = Some(result);
                barrier.complete_one();
            }) {
                *slots[index].lock() = Some(Err(err));
                barrier.complete_one();
            }
        }

        barrier.wait(timeout_ms.saturating_mul(2).max(timeout_ms));

        let results: Vec<LegResult> = slots
            .iter()
            .map(|slot| slot.lock().take().unwrap_or(Err(SessionError::ReadTimeout)))
            .collect();

        let failures: Vec<String> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| format!("leg {i}: {e}")))
            .collect();
        let diagnostic = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };

        (results, diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::manager::SocketManager;
    use crate::RuntimeOptions;
    use corelink_core::endpoint::EndPoint;
    use corelink_core::reactor::ReactorPool;
    use corelink_core::timer::TimerService;

    #[test]
    fn empty_pipeline_is_a_no_op() {
        let (results, diagnostic) = PipelineSession::new().sync();
        assert!(results.is_empty());
        assert!(diagnostic.is_none());
    }

    #[test]
    fn all_legs_fail_fast_against_a_dead_channel() {
        let pool = Arc::new(ReactorPool::new(1).unwrap());
        let timer = Arc::new(TimerService::start(64));
        let manager = SocketManager::start(Arc::clone(&timer), &RuntimeOptions::default());
        let endpoint = EndPoint::new("127.0.0.1:1".parse().unwrap());
        let channel = Channel::init(
            endpoint,
            ChannelOptions::default(),
            pool,
            manager,
            Arc::clone(&timer),
        )
        .unwrap();

        let (results, diagnostic) = PipelineSession::new()
            .pipe(Request::default())
            .pipe(Request::default())
            .to(channel)
            .sync();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
        assert!(diagnostic.is_some());
        timer.shutdown();
    }
}
