//! One pooled TCP connection: non-blocking stream, receive buffer,
//! in-flight session map, and the frame-cutting loop that matches
//! arriving bytes back to the `ReadSession` that is waiting for them.

use crate::error::SessionError;
use crate::read_session::{NotifyInput, ReadSession};
use corelink_core::buffer::IoBuffer;
use corelink_core::endpoint::EndPoint;
use corelink_core::error::CoreError;
use corelink_core::queue::MpscQueue;
use corelink_core::lifecycle::LifeCycleLock;
use corelink_core::reactor::{EventHandler, Reactor, ReactorPool};
use corelink_proto::{FrameOutcome, Protocol, ProtocolKind};
use hashbrown::HashMap;
use mio::net::TcpStream as MioTcpStream;
use mio::Interest;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const MAX_PARALLEL_SESSIONS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketStatus {
    Init = 0,
    Ok = 1,
    ConnectFail = 2,
    ConnectTimeout = 3,
    WriteError = 4,
    ReadError = 5,
    ClosedByServer = 6,
    HeartbeatFail = 7,
    ToBeReclaimed = 8,
}

impl SocketStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SocketStatus::Ok,
            2 => SocketStatus::ConnectFail,
            3 => SocketStatus::ConnectTimeout,
            4 => SocketStatus::WriteError,
            5 => SocketStatus::ReadError,
            6 => SocketStatus::ClosedByServer,
            7 => SocketStatus::HeartbeatFail,
            8 => SocketStatus::ToBeReclaimed,
            _ => SocketStatus::Init,
        }
    }
}

struct ConnectAck {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ConnectAck {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout_ms: i64) -> bool {
        let mut guard = self.done.lock();
        if *guard {
            return true;
        }
        if timeout_ms <= 0 {
            self.cond.wait(&mut guard);
            return true;
        }
        let deadline = Duration::from_millis(timeout_ms as u64);
        let result = self.cond.wait_for(&mut guard, deadline);
        *guard || !result.timed_out()
    }
}

/// What happened when the reactor tried to cut one frame out of the
/// receive buffer.
enum CutResult {
    NotEnough,
    Matched,
    Unmatched,
    Error,
}

/// One pooled connection and everything needed to multiplex concurrent
/// calls over it.
pub struct Socket {
    remote: EndPoint,
    stream: Mutex<Option<MioTcpStream>>,
    fd: OnceCell<i32>,
    status: AtomicU8,
    protocol: OnceCell<Arc<dyn Protocol>>,
    reactor: OnceCell<Arc<Reactor>>,
    reactor_token: Mutex<Option<usize>>,
    read_buf: Mutex<IoBuffer>,
    pending: MpscQueue<Arc<ReadSession>>,
    session_map: Mutex<HashMap<u64, Arc<ReadSession>>>,
    fifo_order: Mutex<VecDeque<u64>>,
    last_active_us: AtomicU64,
    write_mtx: Mutex<()>,
    /// Proves to the socket manager whether the owning `Channel` still
    /// considers this socket current. The Channel takes one shared
    /// count while it holds the socket; releases it when surrendering
    /// (reconnect, explicit drop). The manager's reclaim sweep uses
    /// the upgrade->exclusive transition as a test: it only succeeds
    /// once the Channel has let go.
    ownership: LifeCycleLock,
}

impl Socket {
    pub fn new(remote: EndPoint) -> Arc<Self> {
        Arc::new(Self {
            remote,
            stream: Mutex::new(None),
            fd: OnceCell::new(),
            status: AtomicU8::new(SocketStatus::Init as u8),
            protocol: OnceCell::new(),
            reactor: OnceCell::new(),
            reactor_token: Mutex::new(None),
            read_buf: Mutex::new(IoBuffer::new()),
            pending: MpscQueue::with_capacity(MAX_PARALLEL_SESSIONS),
            session_map: Mutex::new(HashMap::with_capacity(MAX_PARALLEL_SESSIONS)),
            fifo_order: Mutex::new(VecDeque::with_capacity(MAX_PARALLEL_SESSIONS)),
            last_active_us: AtomicU64::new(0),
            write_mtx: Mutex::new(()),
            ownership: LifeCycleLock::new(),
        })
    }

    /// Called once by a Channel when it adopts this socket.
    pub fn claim_ownership(&self) -> bool {
        self.ownership.try_shared()
    }

    /// Called by a Channel when replacing or dropping this socket.
    pub fn release_ownership(&self) {
        self.ownership.release_shared();
    }

    /// Called by the socket manager's sweep: succeeds only once the
    /// owning Channel has released its claim. Only the manager thread
    /// ever calls this for a given socket, so the re-entrant upgrade
    /// is safe to retry tick after tick until the Channel's share
    /// finally drains.
    pub fn try_reclaim_ownership(&self) -> bool {
        self.ownership.try_upgrade();
        self.ownership.try_exclusive()
    }

    pub fn mark_heartbeat_failed(&self) {
        self.set_status(SocketStatus::HeartbeatFail);
    }

    pub fn remote(&self) -> EndPoint {
        self.remote
    }

    pub fn fd(&self) -> i32 {
        self.fd.get().copied().unwrap_or(-1)
    }

    pub fn set_bind_protocol(&self, protocol: Arc<dyn Protocol>) {
        let _ = self.protocol.set(protocol);
    }

    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> {
        self.protocol.get()
    }

    pub fn status(&self) -> SocketStatus {
        SocketStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: SocketStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn active(&self) -> bool {
        self.status() == SocketStatus::Ok
    }

    pub fn last_active_us(&self) -> u64 {
        self.last_active_us.load(Ordering::Acquire)
    }

    /// Connect, waiting on the reactor's `WRITABLE` readiness for the
    /// handshake to finish, then arm the real read handler and hand
    /// this socket's fd-affined reactor to the caller.
    pub fn connect(
        self: &Arc<Self>,
        pool: &ReactorPool,
        connect_timeout_ms: i64,
    ) -> Result<(), CoreError> {
        let mut stream = MioTcpStream::connect(self.remote.socket_addr())?;
        let fd = stream.as_raw_fd();
        let _ = self.fd.set(fd);
        let reactor = Arc::clone(pool.select(fd as usize));

        let ack = Arc::new(ConnectAck::new());
        let ack_for_handler = Arc::clone(&ack);
        let handler: Arc<dyn EventHandler> = Arc::new(move |_readable: bool, writable: bool| {
            if writable {
                ack_for_handler.signal();
            }
        });
        let connect_token = reactor.add_event(&mut stream, Interest::WRITABLE, handler)?;

        let completed = ack.wait(connect_timeout_ms);
        let _ = reactor.remove_event(&mut stream, connect_token);

        if !completed {
            self.set_status(SocketStatus::ConnectTimeout);
            return Err(CoreError::Io(io::Error::new(
                ErrorKind::TimedOut,
                "connect timed out",
            )));
        }

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) => {
                self.set_status(SocketStatus::ConnectFail);
                return Err(CoreError::Io(err));
            }
            Err(err) => {
                self.set_status(SocketStatus::ConnectFail);
                return Err(CoreError::Io(err));
            }
        }

        self.last_active_us.store(corelink_core::timer::now_us(), Ordering::Release);

        let self_for_read = Arc::clone(self);
        let read_handler: Arc<dyn EventHandler> = Arc::new(move |readable: bool, _writable: bool| {
            if readable {
                self_for_read.on_read();
            }
        });
        let read_token = reactor.add_event(&mut stream, Interest::READABLE, read_handler)?;
        *self.reactor_token.lock() = Some(read_token);
        *self.stream.lock() = Some(stream);
        let _ = self.reactor.set(reactor);
        self.set_status(SocketStatus::Ok);
        debug!(fd, remote = %self.remote, "socket connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        if let (Some(reactor), Some(token)) = (self.reactor.get(), *self.reactor_token.lock()) {
            if let Some(mut stream) = self.stream.lock().take() {
                let _ = reactor.remove_event(&mut stream, token);
            }
        }
    }

    /// Register a pending call before writing its request, so any
    /// response racing the write is still matched correctly.
    pub fn prepare_read(&self, session: Arc<ReadSession>) -> bool {
        self.pending.push(session).is_ok()
    }

    /// Write a fully assembled request. Retries on `WouldBlock` until
    /// the whole buffer drains or a hard error occurs; the caller's
    /// read-timeout timer, not this call, bounds overall latency.
    pub fn write(&self, buffer: &mut IoBuffer, timeout_ms: i64) -> Result<(), SessionError> {
        if timeout_ms < 0 {
            warn!(fd = self.fd(), "write attempted after deadline");
            return Err(SessionError::WriteFail);
        }
        if buffer.is_empty() {
            return Err(SessionError::WriteFail);
        }

        let _write_guard = self.write_mtx.lock();
        let mut stream_guard = self.stream.lock();
        let Some(stream) = stream_guard.as_mut() else {
            return Err(SessionError::SocketLost);
        };

        while !buffer.is_empty() {
            match buffer.write_into(stream) {
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(fd = self.fd(), %err, "write failed");
                    self.set_status(SocketStatus::WriteError);
                    return Err(SessionError::WriteFail);
                }
            }
        }
        self.last_active_us.store(corelink_core::timer::now_us(), Ordering::Release);
        Ok(())
    }

    fn on_read(self: &Arc<Self>) {
        let Some(protocol) = self.protocol.get().cloned() else {
            warn!(fd = self.fd(), "read event with no bound protocol");
            self.set_status(SocketStatus::ReadError);
            return;
        };
        if !self.active() {
            return;
        }

        {
            let mut stream_guard = self.stream.lock();
            let Some(stream) = stream_guard.as_mut() else {
                return;
            };
            let mut read_buf = self.read_buf.lock();

            'read: loop {
                match read_buf.append_from_reader(stream) {
                    Ok(0) => {
                        self.set_status(SocketStatus::ClosedByServer);
                        break 'read;
                    }
                    Ok(n) => {
                        trace!(fd = self.fd(), n, "read bytes");
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break 'read,
                    Err(err) => {
                        warn!(fd = self.fd(), %err, "read failed");
                        self.set_status(SocketStatus::ReadError);
                        break 'read;
                    }
                }

                loop {
                    match self.cut_into_message(&mut read_buf, protocol.as_ref()) {
                        CutResult::NotEnough => break,
                        CutResult::Matched | CutResult::Unmatched => continue,
                        CutResult::Error => {
                            self.set_status(SocketStatus::ReadError);
                            break 'read;
                        }
                    }
                }
            }
        }

        self.try_reclaim_session_map();
    }

    fn drain_pending(&self) {
        let mut session_map = self.session_map.lock();
        let mut fifo = self.fifo_order.lock();
        while let Some(session) = self.pending.pop() {
            fifo.push_back(session.request_id);
            if session_map.insert(session.request_id, session).is_some() {
                warn!("duplicate request id inserted into session map");
            }
        }
    }

    fn cut_into_message(&self, read_buf: &mut IoBuffer, protocol: &dyn Protocol) -> CutResult {
        if read_buf.is_empty() {
            return CutResult::NotEnough;
        }

        let outcome = match protocol.parse_frame(read_buf) {
            Ok(FrameOutcome::NeedMore) => return CutResult::NotEnough,
            Ok(other) => other,
            Err(err) => {
                warn!(fd = self.fd(), %err, "frame parse failed, closing");
                return CutResult::Error;
            }
        };
        let (size, request_id, parser_state) = match outcome {
            FrameOutcome::Ready {
                size,
                request_id,
                parser_state,
            }
            | FrameOutcome::Done {
                size,
                request_id,
                parser_state,
            } => (size, request_id, parser_state),
            FrameOutcome::NeedMore => unreachable!("handled above"),
        };

        self.last_active_us.store(corelink_core::timer::now_us(), Ordering::Release);
        self.drain_pending();

        let matched_id = {
            let session_map = self.session_map.lock();
            match request_id {
                Some(id) => Some(id),
                None => {
                    // No per-frame id (HTTP): match the oldest still-live
                    // submission, skipping any already-reclaimed ids.
                    let mut fifo = self.fifo_order.lock();
                    loop {
                        let Some(candidate) = fifo.pop_front() else {
                            break None;
                        };
                        if session_map.contains_key(&candidate) {
                            break Some(candidate);
                        }
                    }
                }
            }
        };

        let Some(id) = matched_id else {
            warn!(fd = self.fd(), "frame with no matching session, dropping");
            read_buf.pop_front(size);
            return CutResult::Unmatched;
        };

        let session = {
            let mut session_map = self.session_map.lock();
            session_map.remove(&id)
        };
        if request_id.is_some() {
            self.fifo_order.lock().retain(|&x| x != id);
        }

        let Some(session) = session else {
            read_buf.pop_front(size);
            return CutResult::Unmatched;
        };

        let framebytes = read_buf.cut_into_vec(size);
        session.notify(NotifyInput::Frame {
            framebytes,
            parser_state,
        });
        CutResult::Matched
    }

    fn try_reclaim_session_map(&self) {
        let mut map = self.session_map.lock();
        map.retain(|_, session| !session.try_reclaim());
    }

    /// Called by the socket manager before dropping its own reference:
    /// reclaim everything still outstanding, yielding any genuinely
    /// stuck sessions back for diagnostic logging.
    pub fn drain_on_teardown(&self) -> Vec<u64> {
        self.drain_pending();
        self.try_reclaim_session_map();
        self.session_map.lock().keys().copied().collect()
    }

    pub fn idle_for(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.last_active_us())
    }

    /// Used by the socket manager as the liveness proof before
    /// reclaiming a whole socket (not just one session): a one-shot
    /// wakeup-and-ack round trip through this socket's reactor proves
    /// no `on_read` invocation from before the call is still running.
    pub fn reactor_barrier(&self, timeout: Duration) -> bool {
        match self.reactor.get() {
            Some(reactor) => reactor.wakeup_and_wait(timeout),
            None => true,
        }
    }
}
