//! Single-thread min-heap timer service fed by per-producer SPSC
//! schedule/cancel queues.
//!
//! Any number of threads may call [`TimerService::schedule`] and
//! [`TimerService::unschedule`] concurrently; only the timer's own
//! thread ever touches the heap, the id->callback map, or the active
//! set. Cross-thread handoff goes through one pair of fixed-capacity
//! SPSC queues per producer thread, registered lazily on first use.

use crate::queue::SpscQueue;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

pub type TaskId = u64;
type Callback = Box<dyn FnOnce() + Send>;

/// Current time as microseconds since the epoch, the unit the original
/// scheduler uses throughout (`abs_time`).
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

struct ScheduleMsg {
    id: TaskId,
    abs_time_us: u64,
    callback: Callback,
}

struct ProducerQueues {
    incoming: SpscQueue<ScheduleMsg>,
    cancel: SpscQueue<TaskId>,
}

impl ProducerQueues {
    fn new(capacity: usize) -> Self {
        Self {
            incoming: SpscQueue::with_capacity(capacity),
            cancel: SpscQueue::with_capacity(capacity),
        }
    }
}

const NO_DEADLINE: u64 = u64::MAX;

struct Shared {
    producers: Mutex<HashMap<ThreadId, Arc<ProducerQueues>>>,
    next_id: AtomicU64,
    nearest_fire: AtomicU64,
    wake_mutex: Mutex<()>,
    wake_cond: Condvar,
    shutdown: AtomicBool,
    capacity: usize,
    high_water: usize,
}

/// Handle to the running timer thread. Dropping this does not stop the
/// thread; call [`TimerService::shutdown`] explicitly so pending
/// active tasks get their deterministic final dispatch.
pub struct TimerService {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn start(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared {
            producers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            nearest_fire: AtomicU64::new(NO_DEADLINE),
            wake_mutex: Mutex::new(()),
            wake_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            capacity,
            high_water: (capacity * 2) / 3,
        });

        let worker = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name("corelink-timer".to_string())
            .spawn(move || run(worker))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            join: Mutex::new(Some(join)),
        }
    }

    fn producer_queues(&self) -> Arc<ProducerQueues> {
        let tid = std::thread::current().id();
        let mut producers = self.shared.producers.lock();
        producers
            .entry(tid)
            .or_insert_with(|| Arc::new(ProducerQueues::new(self.shared.capacity)))
            .clone()
    }

    /// Schedule `callback` to run at `abs_time_us`. Returns a
    /// monotonically increasing non-zero id, or `None` if this
    /// thread's producer queue is full (the caller should surface
    /// `TIMER_BUSY`).
    pub fn schedule(&self, abs_time_us: u64, callback: Callback) -> Option<TaskId> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queues = self.producer_queues();
        let msg = ScheduleMsg {
            id,
            abs_time_us,
            callback,
        };
        if queues.incoming.push(msg).is_err() {
            return None;
        }

        let mut cur = self.shared.nearest_fire.load(Ordering::Acquire);
        let mut notify_needed = abs_time_us < cur;
        while abs_time_us < cur {
            match self.shared.nearest_fire.compare_exchange_weak(
                cur,
                abs_time_us,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if queues.incoming.at_or_above(self.shared.high_water) {
            notify_needed = true;
        }
        if notify_needed {
            let _guard = self.shared.wake_mutex.lock();
            self.shared.wake_cond.notify_one();
        }
        Some(id)
    }

    /// Best-effort cancellation. Returns `false` if this thread's
    /// cancel queue is full; the timer thread may still race and fire
    /// the task before observing the cancellation, which is why the
    /// notify-vs-reclaim protocol, not this return value, is the
    /// source of truth for at-most-once completion.
    pub fn unschedule(&self, id: TaskId) -> bool {
        let queues = self.producer_queues();
        queues.cancel.push(id).is_ok()
    }

    /// Stop the timer thread. Any task still marked active at shutdown
    /// time is executed before the thread exits, so sessions waiting
    /// on a timeout are never left hanging.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.shared.wake_mutex.lock();
            self.shared.wake_cond.notify_one();
        }
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut heap: BinaryHeap<Reverse<(u64, TaskId)>> = BinaryHeap::new();
    let mut callbacks: HashMap<TaskId, Callback> = HashMap::new();
    let mut active: HashSet<TaskId> = HashSet::new();

    loop {
        drain_producers(&shared, &mut heap, &mut callbacks, &mut active);

        if shared.shutdown.load(Ordering::Acquire) {
            run_remaining_active(&mut heap, &mut callbacks, &mut active);
            debug!("timer thread shut down, no active tasks remain");
            return;
        }

        let now = now_us();
        while let Some(&Reverse((when, id))) = heap.peek() {
            if when > now {
                break;
            }
            heap.pop();
            if active.remove(&id) {
                if let Some(cb) = callbacks.remove(&id) {
                    trace!(task_id = id, "timer firing");
                    cb();
                }
            } else {
                callbacks.remove(&id);
            }
        }

        let next_deadline = heap.peek().map(|Reverse((when, _))| *when).unwrap_or(NO_DEADLINE);
        shared.nearest_fire.store(next_deadline, Ordering::Release);

        let wait = if next_deadline == NO_DEADLINE {
            Duration::from_millis(250)
        } else {
            let now = now_us();
            if next_deadline <= now {
                continue;
            }
            Duration::from_micros(next_deadline - now).min(Duration::from_millis(250))
        };

        let mut guard = shared.wake_mutex.lock();
        if !shared.shutdown.load(Ordering::Acquire) {
            shared.wake_cond.wait_for(&mut guard, wait);
        }
    }
}

fn drain_producers(
    shared: &Shared,
    heap: &mut BinaryHeap<Reverse<(u64, TaskId)>>,
    callbacks: &mut HashMap<TaskId, Callback>,
    active: &mut HashSet<TaskId>,
) {
    let producers: Vec<Arc<ProducerQueues>> = shared.producers.lock().values().cloned().collect();
    for queues in producers {
        while let Some(msg) = queues.incoming.pop() {
            heap.push(Reverse((msg.abs_time_us, msg.id)));
            callbacks.insert(msg.id, msg.callback);
            active.insert(msg.id);
        }
        while let Some(id) = queues.cancel.pop() {
            active.remove(&id);
            callbacks.remove(&id);
        }
    }
}

fn run_remaining_active(
    heap: &mut BinaryHeap<Reverse<(u64, TaskId)>>,
    callbacks: &mut HashMap<TaskId, Callback>,
    active: &mut HashSet<TaskId>,
) {
    // Every id in `active` was inserted alongside a matching heap
    // entry in `drain_producers`, so draining the heap here also
    // drains `active` and `callbacks` completely; nothing can be left
    // over in either after this loop.
    while let Some(Reverse((_when, id))) = heap.pop() {
        if active.remove(&id) {
            if let Some(cb) = callbacks.remove(&id) {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_in_scheduled_order() {
        let timer = TimerService::start(64);
        let (tx, rx) = mpsc::channel();
        let base = now_us();
        for (delay_ms, label) in [(30u64, "late"), (5u64, "early"), (15u64, "mid")] {
            let tx = tx.clone();
            timer.schedule(base + delay_ms * 1000, Box::new(move || {
                let _ = tx.send(label);
            }));
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(order, vec!["early", "mid", "late"]);
        timer.shutdown();
    }

    #[test]
    fn unschedule_prevents_fire_when_won_in_time() {
        let timer = TimerService::start(64);
        let (tx, rx) = mpsc::channel::<()>();
        let id = timer
            .schedule(now_us() + 20_000, Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
        assert!(timer.unschedule(id));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timer.shutdown();
    }

    #[test]
    fn shutdown_fires_remaining_active_tasks() {
        let timer = TimerService::start(64);
        let (tx, rx) = mpsc::channel::<()>();
        timer.schedule(now_us() + 60_000_000, Box::new(move || {
            let _ = tx.send(());
        }));
        timer.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_ok());
    }

    #[test]
    fn returns_monotonically_increasing_ids() {
        let timer = TimerService::start(64);
        let a = timer.schedule(now_us(), Box::new(|| {})).unwrap();
        let b = timer.schedule(now_us(), Box::new(|| {})).unwrap();
        assert!(b > a);
        timer.shutdown();
    }
}
