//! # Corelink
//!
//! Client-side RPC runtime multiplexing request/response exchanges over
//! pooled, non-blocking TCP connections.
//!
//! ## Architecture
//!
//! - **`corelink-core`**: reactor, timer service, SPSC/MPSC queues, the
//!   generic `IoBuffer`, and the three-state `LifeCycleLock` the rest
//!   of the runtime arbitrates ownership with.
//! - **`corelink-proto`**: sans-IO wire protocol vtables (Bolt, HTTP).
//! - **`corelink`**: this crate, the public API surface — `Channel`,
//!   `Session`, `PipelineSession`, and the socket manager that keeps
//!   connections alive and reclaims dead ones.
//!
//! ## Quick start
//!
//! ```no_run
//! use corelink::prelude::*;
//!
//! corelink::global_init();
//! let endpoint = EndPoint::parse("127.0.0.1:12200").unwrap();
//! let channel = Channel::init(
//!     endpoint,
//!     ChannelOptions::default(),
//!     corelink::reactor_pool(),
//!     corelink::socket_manager(),
//!     corelink::global_timer(),
//! ).unwrap();
//! ```

pub mod channel;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod read_session;
pub mod session;
pub mod socket;

use corelink_core::reactor::ReactorPool;
use corelink_core::timer::TimerService;
use manager::SocketManager;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::{EnvFilter, Layer};

/// Mirrors the original system's `LogLevel` enum, mapped onto
/// `tracing::Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Tunables for the process-wide reactor pool, timer service and
/// socket manager. Built once at [`global_init_with_options`] time;
/// individual `Channel`s layer their own [`channel::ChannelOptions`]
/// on top.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of reactor threads in the pool. Sockets are affined to
    /// one by `fd mod reactor_count`.
    pub reactor_count: usize,
    /// Per-producer-thread SPSC queue depth feeding the timer thread.
    pub timer_queue_capacity: usize,
    /// Queue depth past which a schedule call wakes the timer thread
    /// eagerly instead of waiting for its next poll.
    pub timer_high_water_mark: usize,
    /// A socket idle longer than this (microseconds) becomes eligible
    /// for a heartbeat on the manager's next tick.
    pub socket_idle_threshold_us: u64,
    /// How often the socket manager wakes to sweep, reclaim and
    /// heartbeat, in milliseconds.
    pub manager_tick_ms: u64,
    /// How long the manager waits for a reactor's wakeup
    /// acknowledgement before deferring a socket's reclaim to the next
    /// tick, in milliseconds.
    pub manager_reclaim_wait_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let capacity = 4096;
        Self {
            reactor_count: num_cpus::get(),
            timer_queue_capacity: capacity,
            timer_high_water_mark: (capacity * 2) / 3,
            socket_idle_threshold_us: 15_000_000,
            manager_tick_ms: 1000,
            manager_reclaim_wait_ms: 500,
        }
    }
}

struct Runtime {
    reactor_pool: Arc<ReactorPool>,
    timer: Arc<TimerService>,
    manager: Arc<SocketManager>,
}

static RUNTIME: OnceCell<Runtime> = OnceCell::new();
static LOG_HANDLE: OnceCell<reload::Handle<EnvFilter, tracing_subscriber::Registry>> = OnceCell::new();

/// Install a `tracing_subscriber` fmt layer driven by `RUST_LOG`
/// (`info` if unset). Safe to call more than once; only the first
/// caller's filter wins. Called automatically by [`global_init`], but
/// exposed so a host application can install its own subscriber first
/// and skip this one entirely.
pub fn init_logging() {
    LOG_HANDLE.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let (filter_layer, handle) = reload::Layer::new(filter);
        let fmt_layer = tracing_subscriber::fmt::layer().with_filter(filter_layer);
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
        handle
    });
}

/// Adjust the installed subscriber's level filter at runtime. A no-op
/// if [`init_logging`] (or [`global_init`]) has not run yet, or if the
/// embedding application installed its own subscriber instead.
pub fn set_log_level(level: LogLevel) {
    if let Some(handle) = LOG_HANDLE.get() {
        let _ = handle.modify(|filter| *filter = EnvFilter::from(LevelFilter::from(level)));
    }
}

/// Bring up the reactor pool, timer service and socket manager with
/// default [`RuntimeOptions`]. Idempotent: later calls are no-ops.
pub fn global_init() -> Arc<ReactorPool> {
    global_init_with_options(&RuntimeOptions::default())
}

/// Same as [`global_init`], but with caller-supplied tunables. Only
/// the first call's options take effect; later calls with different
/// options are silently ignored, since the runtime is already up.
pub fn global_init_with_options(options: &RuntimeOptions) -> Arc<ReactorPool> {
    init_logging();
    let runtime = RUNTIME.get_or_init(|| {
        let reactor_pool =
            Arc::new(ReactorPool::new(options.reactor_count).expect("failed to start reactor pool"));
        let timer = Arc::new(TimerService::start(options.timer_queue_capacity));
        let manager = SocketManager::start(Arc::clone(&timer), options);
        Runtime {
            reactor_pool,
            timer,
            manager,
        }
    });
    Arc::clone(&runtime.reactor_pool)
}

/// The process-wide reactor pool, starting it with default options if
/// this is the first call into the runtime.
pub fn reactor_pool() -> Arc<ReactorPool> {
    global_init()
}

/// The process-wide socket manager, starting the runtime with default
/// options if needed.
pub fn socket_manager() -> Arc<SocketManager> {
    global_init();
    Arc::clone(&RUNTIME.get().expect("global_init always populates RUNTIME").manager)
}

/// The process-wide timer service, starting the runtime with default
/// options if needed. Used by `Session`/`PipelineSession` to schedule
/// read timeouts against the same timer the socket manager heartbeats
/// through.
pub fn global_timer() -> Arc<TimerService> {
    global_init();
    Arc::clone(&RUNTIME.get().expect("global_init always populates RUNTIME").timer)
}

/// Tear down the reactor pool, timer service and socket manager. Only
/// meaningful in tests and short-lived tools; most processes simply
/// exit with the runtime still up.
pub fn global_destroy() {
    if let Some(runtime) = RUNTIME.get() {
        runtime.manager.shutdown();
        runtime.timer.shutdown();
        runtime.reactor_pool.shutdown();
    }
}

/// Re-export the pieces most callers need in one place.
pub mod prelude {
    pub use crate::channel::{Channel, ChannelOptions, ConnectionType};
    pub use crate::error::SessionError;
    pub use crate::pipeline::PipelineSession;
    pub use crate::session::Session;
    pub use corelink_core::endpoint::EndPoint;
    pub use corelink_proto::{ProtocolKind, Request, Response};
}
