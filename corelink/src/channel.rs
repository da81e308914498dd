//! Logical endpoint: address, protocol, connection policy, and socket
//! acquisition (single long-lived connection, short-lived reconnect-
//! every-call, or a pool of connections shared across threads).

use crate::error::SessionError;
use crate::manager::SocketManager;
use crate::socket::Socket;
use corelink_core::endpoint::EndPoint;
use corelink_core::reactor::ReactorPool;
use corelink_core::timer::TimerService;
use corelink_proto::{protocol_for, Protocol, ProtocolKind};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Single,
    Pooled,
    Short,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout_ms: i64,
    pub timeout_ms: i64,
    pub max_retry: u32,
    pub pool_size: usize,
    pub protocol: ProtocolKind,
    pub connection_type: ConnectionType,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 200,
            timeout_ms: 500,
            max_retry: 3,
            pool_size: num_cpus::get(),
            protocol: ProtocolKind::Bolt,
            connection_type: ConnectionType::Single,
        }
    }
}

impl ChannelOptions {
    pub fn connect_timeout_ms(mut self, v: i64) -> Self {
        self.connect_timeout_ms = v;
        self
    }

    pub fn timeout_ms(mut self, v: i64) -> Self {
        self.timeout_ms = v;
        self
    }

    pub fn max_retry(mut self, v: u32) -> Self {
        self.max_retry = v;
        self
    }

    pub fn pool_size(mut self, v: usize) -> Self {
        self.pool_size = v;
        self
    }

    pub fn protocol(mut self, v: ProtocolKind) -> Self {
        self.protocol = v;
        self
    }

    pub fn connection_type(mut self, v: ConnectionType) -> Self {
        self.connection_type = v;
        self
    }
}

/// One physical connection slot: a reconnectable socket plus the
/// mutex serializing concurrent reconnect attempts against it.
struct Slot {
    socket: Mutex<Option<Arc<Socket>>>,
    reconnect_mtx: Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            reconnect_mtx: Mutex::new(()),
        }
    }

    fn get_socket(
        &self,
        endpoint: EndPoint,
        protocol_kind: ProtocolKind,
        reactor_pool: &ReactorPool,
        manager: &SocketManager,
        connect_timeout_ms: i64,
        force_reconnect: bool,
    ) -> Result<Arc<Socket>, SessionError> {
        if !force_reconnect {
            if let Some(sock) = self.socket.lock().as_ref() {
                if sock.active() {
                    return Ok(Arc::clone(sock));
                }
            }
        }

        let _reconnect_guard = self.reconnect_mtx.lock();
        if !force_reconnect {
            if let Some(sock) = self.socket.lock().as_ref() {
                if sock.active() {
                    return Ok(Arc::clone(sock));
                }
            }
        }

        if let Some(old) = self.socket.lock().take() {
            old.release_ownership();
        }

        let new_socket = Socket::new(endpoint);
        new_socket.set_bind_protocol(protocol_for(protocol_kind));
        new_socket
            .connect(reactor_pool, connect_timeout_ms)
            .map_err(SessionError::from)?;
        new_socket.claim_ownership();
        manager.watch(Arc::clone(&new_socket));
        *self.socket.lock() = Some(Arc::clone(&new_socket));
        Ok(new_socket)
    }
}

struct SubChannel {
    slot: Slot,
    shared_num: Arc<AtomicUsize>,
    is_active: Arc<AtomicBool>,
}

/// Decrements a subchannel's affinity counter when the affined thread
/// drops its claim (thread exit, or re-selection after failure).
struct AffinityGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

thread_local! {
    static POOL_AFFINITY: RefCell<StdHashMap<usize, (usize, AffinityGuard)>> =
        RefCell::new(StdHashMap::new());
}

enum ChannelKind {
    Direct(Slot),
    Pooled(Vec<SubChannel>),
}

pub struct Channel {
    endpoint: EndPoint,
    options: ChannelOptions,
    reactor_pool: Arc<ReactorPool>,
    manager: Arc<SocketManager>,
    timer: Arc<TimerService>,
    protocol: Arc<dyn Protocol>,
    kind: ChannelKind,
}

impl Channel {
    /// Construct a channel. Sockets are acquired lazily on first
    /// `get_socket` call, not eagerly here.
    pub fn init(
        endpoint: EndPoint,
        options: ChannelOptions,
        reactor_pool: Arc<ReactorPool>,
        manager: Arc<SocketManager>,
        timer: Arc<TimerService>,
    ) -> Result<Arc<Self>, SessionError> {
        let kind = match options.connection_type {
            ConnectionType::Single | ConnectionType::Short => ChannelKind::Direct(Slot::new()),
            ConnectionType::Pooled => {
                if options.pool_size == 0 {
                    return Err(corelink_core::error::CoreError::InvalidPoolSize.into());
                }
                let subs = (0..options.pool_size)
                    .map(|_| SubChannel {
                        slot: Slot::new(),
                        shared_num: Arc::new(AtomicUsize::new(0)),
                        is_active: Arc::new(AtomicBool::new(true)),
                    })
                    .collect();
                ChannelKind::Pooled(subs)
            }
        };

        let protocol = protocol_for(options.protocol);

        Ok(Arc::new(Self {
            endpoint,
            options,
            reactor_pool,
            manager,
            timer,
            protocol,
            kind,
        }))
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn endpoint(&self) -> EndPoint {
        self.endpoint
    }

    pub fn timer(&self) -> &Arc<TimerService> {
        &self.timer
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn get_socket(&self) -> Result<Arc<Socket>, SessionError> {
        match &self.kind {
            ChannelKind::Direct(slot) => {
                let force = self.options.connection_type == ConnectionType::Short;
                slot.get_socket(
                    self.endpoint,
                    self.options.protocol,
                    &self.reactor_pool,
                    &self.manager,
                    self.options.connect_timeout_ms,
                    force,
                )
            }
            ChannelKind::Pooled(subs) => self.get_pooled_socket(subs),
        }
    }

    fn get_pooled_socket(&self, subs: &[SubChannel]) -> Result<Arc<Socket>, SessionError> {
        let channel_key = self as *const Channel as usize;
        let mut sticky = POOL_AFFINITY.with(|m| m.borrow().get(&channel_key).map(|(i, _)| *i));

        loop {
            let chosen = match sticky {
                Some(i) if subs[i].is_active.load(Ordering::Acquire) => i,
                _ => self.select_subchannel(subs),
            };

            match subs[chosen].slot.get_socket(
                self.endpoint,
                self.options.protocol,
                &self.reactor_pool,
                &self.manager,
                self.options.connect_timeout_ms,
                false,
            ) {
                Ok(sock) => {
                    if sticky != Some(chosen) {
                        subs[chosen].shared_num.fetch_add(1, Ordering::AcqRel);
                        let guard = AffinityGuard {
                            counter: Arc::clone(&subs[chosen].shared_num),
                        };
                        POOL_AFFINITY.with(|m| {
                            m.borrow_mut().insert(channel_key, (chosen, guard));
                        });
                    }
                    return Ok(sock);
                }
                Err(err) => {
                    subs[chosen].is_active.store(false, Ordering::Release);
                    sticky = None;
                    POOL_AFFINITY.with(|m| {
                        m.borrow_mut().remove(&channel_key);
                    });
                    if !subs.iter().any(|s| s.is_active.load(Ordering::Acquire)) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn select_subchannel(&self, subs: &[SubChannel]) -> usize {
        let active: Vec<usize> = (0..subs.len())
            .filter(|&i| subs[i].is_active.load(Ordering::Acquire))
            .collect();
        if active.is_empty() {
            return rand::random::<usize>() % subs.len();
        }
        *active
            .iter()
            .min_by_key(|&&i| subs[i].shared_num.load(Ordering::Acquire))
            .expect("active is non-empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelink_core::timer::TimerService;
    use crate::RuntimeOptions;

    fn test_fixture() -> (Arc<ReactorPool>, Arc<SocketManager>, Arc<TimerService>) {
        let pool = Arc::new(ReactorPool::new(1).unwrap());
        let timer = Arc::new(TimerService::start(64));
        let manager = SocketManager::start(Arc::clone(&timer), &RuntimeOptions::default());
        (pool, manager, timer)
    }

    #[test]
    fn pooled_init_rejects_zero_pool_size() {
        let (pool, manager, timer) = test_fixture();
        let endpoint = EndPoint::new("127.0.0.1:1".parse().unwrap());
        let options = ChannelOptions::default()
            .connection_type(ConnectionType::Pooled)
            .pool_size(0);
        let result = Channel::init(endpoint, options, pool, manager, timer);
        assert!(result.is_err());
    }

    #[test]
    fn get_socket_surfaces_connect_failure() {
        let (pool, manager, timer) = test_fixture();
        // Port 1 is privileged/unused; connect should fail quickly.
        let endpoint = EndPoint::new("127.0.0.1:1".parse().unwrap());
        let options = ChannelOptions::default().connect_timeout_ms(200);
        let channel = Channel::init(endpoint, options, pool, manager, timer).unwrap();
        assert!(channel.get_socket().is_err());
    }
}
