//! One reactor per thread: an edge-triggered readiness loop over a
//! platform demultiplexer (`epoll` on Linux, `kqueue` on macOS/BSD via
//! `mio`), plus a wake mechanism used for the socket manager's
//! provable one-shot reclamation handshake.

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Registered per fd; invoked by the reactor's own thread whenever the
/// demultiplexer reports readiness. Readable/writable flags mirror the
/// `mio::event::Event` the reactor observed.
pub trait EventHandler: Send + Sync {
    fn handle(&self, readable: bool, writable: bool);
}

impl<F> EventHandler for F
where
    F: Fn(bool, bool) + Send + Sync,
{
    fn handle(&self, readable: bool, writable: bool) {
        (self)(readable, writable)
    }
}

struct WakeAck {
    acked: Mutex<bool>,
    cond: Condvar,
}

enum Command {
    Wake(Arc<WakeAck>),
}

/// One reactor thread and its registration surface.
pub struct Reactor {
    index: usize,
    registry: mio::Registry,
    waker: Arc<Waker>,
    commands: Mutex<Vec<Command>>,
    handlers: RwLock<hashbrown::HashMap<usize, Arc<dyn EventHandler>>>,
    next_token: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    fn spawn(index: usize) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let reactor = Arc::new(Reactor {
            index,
            registry,
            waker,
            commands: Mutex::new(Vec::new()),
            handlers: RwLock::new(hashbrown::HashMap::new()),
            next_token: AtomicUsize::new(0),
            shutdown: Arc::clone(&shutdown),
            join: Mutex::new(None),
        });

        let worker = Arc::clone(&reactor);
        let handle = std::thread::Builder::new()
            .name(format!("corelink-reactor-{index}"))
            .spawn(move || worker.run(poll, shutdown))
            .map_err(io::Error::other)?;
        *reactor.join.lock() = Some(handle);
        Ok(reactor)
    }

    fn run(self: Arc<Self>, mut poll: Poll, shutdown: Arc<AtomicBool>) {
        let mut events = Events::with_capacity(256);
        while !shutdown.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(500))) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(reactor = self.index, %err, "poll failed");
                continue;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_commands();
                    continue;
                }
                let handler = self.handlers.read().get(&event.token().0).cloned();
                if let Some(handler) = handler {
                    handler.handle(event.is_readable(), event.is_writable());
                } else {
                    trace!(reactor = self.index, token = event.token().0, "stale readiness event");
                }
            }
        }
        debug!(reactor = self.index, "reactor thread exiting");
    }

    fn drain_commands(&self) {
        let pending: Vec<Command> = std::mem::take(&mut self.commands.lock());
        for cmd in pending {
            match cmd {
                Command::Wake(ack) => {
                    *ack.acked.lock() = true;
                    ack.cond.notify_all();
                }
            }
        }
    }

    /// Register `source` for the given interest, returning a token
    /// stable for the lifetime of the registration. The handler is
    /// invoked on this reactor's own thread.
    pub fn add_event<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> io::Result<usize>
    where
        S: mio::event::Source + ?Sized,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.registry.register(source, Token(token), interest)?;
        self.handlers.write().insert(token, handler);
        Ok(token)
    }

    pub fn modify_event<S>(&self, source: &mut S, token: usize, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.registry.reregister(source, Token(token), interest)
    }

    pub fn remove_event<S>(&self, source: &mut S, token: usize) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.registry.deregister(source)?;
        self.handlers.write().remove(&token);
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Post a one-shot wakeup to this reactor and block until it has
    /// acknowledged having turned its loop since the wakeup was
    /// requested, or until `timeout` elapses. A successful return
    /// proves the reactor is no longer inside any handler that was
    /// registered before this call — the reclamation barrier the
    /// socket manager relies on.
    pub fn wakeup_and_wait(&self, timeout: Duration) -> bool {
        let ack = Arc::new(WakeAck {
            acked: Mutex::new(false),
            cond: Condvar::new(),
        });
        self.commands.lock().push(Command::Wake(Arc::clone(&ack)));
        if self.waker.wake().is_err() {
            return false;
        }
        let mut guard = ack.acked.lock();
        if !*guard {
            let result = ack.cond.wait_for(&mut guard, timeout);
            if result.timed_out() && !*guard {
                return false;
            }
        }
        *guard
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}

/// A fixed-size pool of reactors, one per thread, selected by stable
/// `fd mod N` affinity.
pub struct ReactorPool {
    reactors: Vec<Arc<Reactor>>,
}

impl ReactorPool {
    pub fn new(count: usize) -> io::Result<Self> {
        let count = count.max(1);
        let mut reactors = Vec::with_capacity(count);
        for i in 0..count {
            reactors.push(Reactor::spawn(i)?);
        }
        Ok(Self { reactors })
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Select the reactor affined to `fd` via `fd mod N`.
    pub fn select(&self, fd: usize) -> &Arc<Reactor> {
        &self.reactors[fd % self.reactors.len()]
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Reactor>> {
        self.reactors.get(index)
    }

    pub fn shutdown(&self) {
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::mpsc;

    #[test]
    fn wakeup_roundtrip_acknowledges() {
        let pool = ReactorPool::new(1).unwrap();
        let reactor = pool.select(0);
        let acked = reactor.wakeup_and_wait(Duration::from_millis(500));
        assert!(acked);
        pool.shutdown();
    }

    #[test]
    fn select_is_stable_affinity() {
        let pool = ReactorPool::new(4).unwrap();
        assert_eq!(pool.select(7).index(), pool.select(7).index());
        assert_eq!(pool.select(7).index(), 3);
        pool.shutdown();
    }

    #[test]
    fn dispatches_readable_event() {
        use mio::net::TcpListener;
        use std::net::TcpStream as StdTcpStream;

        let pool = ReactorPool::new(1).unwrap();
        let reactor = pool.select(0);

        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let counter = Arc::new(Counter::new(0));
        let counter_clone = Arc::clone(&counter);
        let tx = Mutex::new(Some(tx));
        let handler: Arc<dyn EventHandler> = Arc::new(move |readable: bool, _writable: bool| {
            if readable {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });
        reactor
            .add_event(&mut listener, Interest::READABLE, handler)
            .unwrap();

        let _client = StdTcpStream::connect(addr).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 1);
        pool.shutdown();
    }
}
