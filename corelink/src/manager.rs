//! Background socket manager: one tick thread that reclaims sockets a
//! Channel has surrendered and heartbeats idle ones.

use crate::read_session::{NotifyInput, ReadSession};
use crate::RuntimeOptions;
use corelink_core::timer::{now_us, TimerService};
use corelink_proto::Protocol;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::socket::Socket;

const HEARTBEAT_TIMEOUT_MS: i64 = 200;

pub struct SocketManager {
    timer: Arc<TimerService>,
    watch_list: Mutex<Vec<Arc<Socket>>>,
    reclaim_list: Mutex<Vec<Arc<Socket>>>,
    tick_ms: u64,
    reclaim_wait_ms: u64,
    idle_threshold_us: u64,
    shutdown: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SocketManager {
    pub fn start(timer: Arc<TimerService>, options: &RuntimeOptions) -> Arc<Self> {
        let manager = Arc::new(Self {
            timer,
            watch_list: Mutex::new(Vec::new()),
            reclaim_list: Mutex::new(Vec::new()),
            tick_ms: options.manager_tick_ms,
            reclaim_wait_ms: options.manager_reclaim_wait_ms,
            idle_threshold_us: options.socket_idle_threshold_us,
            shutdown: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        });

        let worker = Arc::clone(&manager);
        let handle = std::thread::Builder::new()
            .name("corelink-socket-manager".to_string())
            .spawn(move || worker.run())
            .expect("failed to spawn socket manager thread");
        *manager.join.lock() = Some(handle);
        manager
    }

    pub fn watch(&self, socket: Arc<Socket>) {
        self.watch_list.lock().push(socket);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(self.tick_ms));
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.tick();
        }
    }

    fn tick(&self) {
        self.sweep_surrendered();
        self.drain_reclaim_list();
        self.heartbeat_idle_sockets();
    }

    /// Step 1: sockets no longer active whose owning Channel has let
    /// go move from the watch list to the reclaim list.
    fn sweep_surrendered(&self) {
        let mut watch = self.watch_list.lock();
        let mut still_watching = Vec::with_capacity(watch.len());
        let mut reclaimable = Vec::new();
        for socket in watch.drain(..) {
            if !socket.active() && socket.try_reclaim_ownership() {
                socket.disconnect();
                reclaimable.push(socket);
            } else {
                still_watching.push(socket);
            }
        }
        *watch = still_watching;
        drop(watch);
        self.reclaim_list.lock().extend(reclaimable);
    }

    /// Step 2: for each reclaimable socket, wait for a proof that its
    /// reactor has turned its loop since deregistration, then drop the
    /// last strong reference.
    fn drain_reclaim_list(&self) {
        let pending: Vec<Arc<Socket>> = std::mem::take(&mut *self.reclaim_list.lock());
        let mut still_pending = Vec::new();
        for socket in pending {
            if socket.reactor_barrier(Duration::from_millis(self.reclaim_wait_ms)) {
                let stuck = socket.drain_on_teardown();
                if !stuck.is_empty() {
                    warn!(
                        fd = socket.fd(),
                        outstanding = stuck.len(),
                        "sessions still unresolved at socket teardown"
                    );
                }
                debug!(fd = socket.fd(), "socket reclaimed");
            } else {
                warn!(fd = socket.fd(), "reactor did not ack wakeup in time, deferring");
                still_pending.push(socket);
            }
        }
        self.reclaim_list.lock().extend(still_pending);
    }

    /// Step 3: heartbeat sockets that have been idle past the
    /// configured threshold, for protocols that support it.
    fn heartbeat_idle_sockets(&self) {
        let now = now_us();
        let candidates: Vec<Arc<Socket>> = self
            .watch_list
            .lock()
            .iter()
            .filter(|s| s.active() && s.idle_for(now) > self.idle_threshold_us)
            .cloned()
            .collect();

        for socket in candidates {
            let Some(protocol) = socket.protocol().cloned() else {
                continue;
            };
            if !protocol.supports_heartbeat() {
                continue;
            }
            self.run_heartbeat(&socket, protocol);
        }
    }

    fn run_heartbeat(&self, socket: &Arc<Socket>, protocol: Arc<dyn Protocol>) {
        let (mut buf, request_id) = match protocol.assemble_heartbeat() {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let submit = now_us();
        let expire = submit + (HEARTBEAT_TIMEOUT_MS as u64) * 1_000;
        let session = ReadSession::new_sync(request_id, submit, Some(expire), Arc::clone(&protocol));

        if !socket.prepare_read(Arc::clone(&session)) {
            warn!(fd = socket.fd(), "heartbeat session queue full, skipping this tick");
            return;
        }

        let guard = session.baseline_guard();
        let timer_session = Arc::clone(&session);
        let scheduled = self.timer.schedule(
            expire,
            Box::new(move || {
                let _guard = guard;
                timer_session.notify(NotifyInput::Timeout);
            }),
        );
        if scheduled.is_none() {
            warn!(fd = socket.fd(), "heartbeat timer busy, skipping this tick");
            return;
        }

        if !session.add_caller_share() {
            return;
        }
        if socket.write(&mut buf, HEARTBEAT_TIMEOUT_MS).is_err() {
            session.release_caller_share();
            warn!(fd = socket.fd(), "heartbeat write failed");
            socket.mark_heartbeat_failed();
            return;
        }

        let outcome = session.wait_sync();
        session.release_caller_share();

        let verified = outcome.error == SessionError::Ok
            && outcome
                .raw_frame
                .as_ref()
                .map(|frame| protocol.verify_heartbeat(frame).unwrap_or(false))
                .unwrap_or(false);

        if verified {
            debug!(fd = socket.fd(), "heartbeat ok");
        } else {
            let error = outcome.error;
            warn!(fd = socket.fd(), ?error, "heartbeat failed, marking socket for reclaim");
            socket.mark_heartbeat_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_core::endpoint::EndPoint;

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            manager_tick_ms: 20,
            manager_reclaim_wait_ms: 200,
            ..RuntimeOptions::default()
        }
    }

    #[test]
    fn watch_and_shutdown_do_not_panic() {
        let timer = Arc::new(TimerService::start(64));
        let manager = SocketManager::start(Arc::clone(&timer), &options());
        let socket = Socket::new(EndPoint::new("127.0.0.1:1".parse().unwrap()));
        manager.watch(socket);
        std::thread::sleep(Duration::from_millis(60));
        manager.shutdown();
        timer.shutdown();
    }
}
