//! One request/response exchange: `send(request).to(channel)
//! .receive_to(expected).sync()` or `.async(callback)`.

use crate::channel::Channel;
use crate::error::SessionError;
use crate::read_session::{next_request_id, now_us, NotifyInput, ReadSession};
use corelink_proto::{Protocol, Request, Response};
use std::sync::Arc;
use tracing::{info_span, warn};

/// Builder for one send/receive exchange. Constructed via
/// [`Session::send`]; each setter consumes and returns `self` so the
/// call reads as one expression.
pub struct Session {
    request: Request,
    channel: Option<Arc<Channel>>,
    timeout_ms: Option<i64>,
    max_retry: Option<u32>,
}

impl Session {
    pub fn send(request: Request) -> Self {
        Self {
            request,
            channel: None,
            timeout_ms: None,
            max_retry: None,
        }
    }

    pub fn to(mut self, channel: Arc<Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Override the Channel's default timeout for this call alone.
    pub fn timeout_ms(mut self, ms: i64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Override the Channel's default retry budget for this call alone.
    pub fn max_retry(mut self, retries: u32) -> Self {
        self.max_retry = Some(retries);
        self
    }

    /// `receive_to` only threads information in the original's typed
    /// out-param style through to the caller; the actual `Response` is
    /// what `sync`/`async` hand back, so this is a no-op placeholder
    /// kept for call-site symmetry with `send`.
    pub fn receive_to(self, _expected: &Response) -> Self {
        self
    }

    /// Run the send path synchronously, retrying per §4.7's policy.
    pub fn sync(self) -> Result<Response, SessionError> {
        let Some(channel) = self.channel.clone() else {
            return Err(SessionError::ProtocolNotFound);
        };
        let timeout_ms = self.timeout_ms.unwrap_or(channel.options().timeout_ms);
        let max_retry = self.max_retry.unwrap_or(channel.options().max_retry).max(1);

        let mut last_error = SessionError::SocketLost;
        for attempt in 0..max_retry {
            match self.try_once(&channel, timeout_ms) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_error = err;
                    if err == SessionError::ReadTimeout {
                        break;
                    }
                    warn!(attempt, ?err, "send attempt failed, retrying");
                }
            }
        }
        Err(last_error)
    }

    /// Run the send path once, invoking `callback` from whichever
    /// thread's reactor completes it (or the timer thread, on
    /// timeout). Does not retry: the caller chooses whether to resend.
    pub fn send_async<F>(self, callback: F) -> Result<(), SessionError>
    where
        F: FnOnce(Result<Response, SessionError>) + Send + 'static,
    {
        let Some(channel) = self.channel.clone() else {
            return Err(SessionError::ProtocolNotFound);
        };
        let timeout_ms = self.timeout_ms.unwrap_or(channel.options().timeout_ms);
        self.try_once_async(&channel, timeout_ms, Box::new(callback))
    }

    fn try_once(&self, channel: &Arc<Channel>, timeout_ms: i64) -> Result<Response, SessionError> {
        let protocol = Arc::clone(channel.protocol());
        let socket = channel.get_socket()?;
        let _span = info_span!("socket", fd = socket.fd(), remote = %socket.remote()).entered();

        let request_id = protocol.normalize_request_id(next_request_id());
        let mut buffer = protocol
            .assemble_request(&self.request, request_id)
            .map_err(|_| SessionError::AssembleRequestFail)?;

        let submit = now_us();
        let expire = if timeout_ms > 0 {
            Some(submit + (timeout_ms as u64) * 1_000)
        } else {
            None
        };
        let session = ReadSession::new_sync(request_id, submit, expire, Arc::clone(&protocol));

        if !socket.prepare_read(Arc::clone(&session)) {
            session.release_baseline_share();
            return Err(SessionError::SocketBusy);
        }

        let guard = session.baseline_guard();
        let Some(expire) = expire else {
            std::mem::forget(guard);
            return self.finish_unbounded(&session, &socket, &mut buffer, timeout_ms);
        };

        let timer_session = Arc::clone(&session);
        let timer = channel.timer();
        let Some(task_id) = timer.schedule(
            expire,
            Box::new(move || {
                let _guard = guard;
                timer_session.notify(NotifyInput::Timeout);
            }),
        ) else {
            return Err(SessionError::TimerBusy);
        };

        if !session.add_caller_share() {
            timer.unschedule(task_id);
            return Err(SessionError::SocketLost);
        }
        if let Err(err) = socket.write(&mut buffer, timeout_ms) {
            timer.unschedule(task_id);
            session.release_caller_share();
            return Err(err);
        }

        let outcome = session.wait_sync();
        session.release_caller_share();
        outcome_to_result(outcome)
    }

    /// A zero/negative timeout (`timeout_ms <= 0`) means "wait
    /// forever"; there is no timer to schedule, so the baseline share
    /// lives only as long as this call is on the stack. Kept separate
    /// from the common path so the common path always has a timer to
    /// reason about.
    fn finish_unbounded(
        &self,
        session: &Arc<ReadSession>,
        socket: &Arc<crate::socket::Socket>,
        buffer: &mut corelink_core::buffer::IoBuffer,
        timeout_ms: i64,
    ) -> Result<Response, SessionError> {
        if !session.add_caller_share() {
            session.release_baseline_share();
            return Err(SessionError::SocketLost);
        }
        if let Err(err) = socket.write(buffer, timeout_ms.max(1)) {
            session.release_caller_share();
            session.release_baseline_share();
            return Err(err);
        }
        let outcome = session.wait_sync();
        session.release_caller_share();
        session.release_baseline_share();
        outcome_to_result(outcome)
    }

    /// `prepare_read` makes the session visible to the reactor through
    /// the socket's pending queue, at which point the callback is
    /// committed to fire exactly once. Every failure observed after
    /// that point is therefore resolved through `notify` (which
    /// invokes the callback itself) rather than returned from this
    /// function, so the caller never sees both an `Err` return and a
    /// later callback firing for the same send.
    fn try_once_async(
        &self,
        channel: &Arc<Channel>,
        timeout_ms: i64,
        callback: Box<dyn FnOnce(Result<Response, SessionError>) + Send>,
    ) -> Result<(), SessionError> {
        let protocol = Arc::clone(channel.protocol());
        let socket = channel.get_socket()?;

        let request_id = protocol.normalize_request_id(next_request_id());
        let mut buffer = protocol
            .assemble_request(&self.request, request_id)
            .map_err(|_| SessionError::AssembleRequestFail)?;

        let submit = now_us();
        if timeout_ms <= 0 {
            return self.send_unbounded_async(&socket, &protocol, request_id, submit, &mut buffer, callback);
        }

        let expire = submit + (timeout_ms as u64) * 1_000;
        let session = ReadSession::new_async(
            request_id,
            submit,
            Some(expire),
            Arc::clone(&protocol),
            Box::new(move |outcome| callback(outcome_to_result(outcome))),
        );

        if !socket.prepare_read(Arc::clone(&session)) {
            session.release_baseline_share();
            return Err(SessionError::SocketBusy);
        }

        let guard = session.baseline_guard();
        let timer_session = Arc::clone(&session);
        let timer = channel.timer();
        let task_id = timer.schedule(
            expire,
            Box::new(move || {
                let _guard = guard;
                timer_session.notify(NotifyInput::Timeout);
            }),
        );
        let Some(task_id) = task_id else {
            session.notify(NotifyInput::Failed(SessionError::TimerBusy));
            return Ok(());
        };

        if let Err(err) = socket.write(&mut buffer, timeout_ms) {
            timer.unschedule(task_id);
            session.notify(NotifyInput::Failed(err));
        }
        Ok(())
    }

    /// A zero/negative timeout (`timeout_ms <= 0`) means "wait forever",
    /// the same convention `finish_unbounded` applies on the sync path.
    /// There is no timer to hold the baseline share until the session
    /// resolves, so the share is handed to the callback itself: it is
    /// stashed in `guard_cell` once the session is registered with the
    /// reactor, and whichever notify wins (a matched frame, or the
    /// explicit `Failed` below) takes it back out and drops it right
    /// after delivering the result.
    fn send_unbounded_async(
        &self,
        socket: &Arc<crate::socket::Socket>,
        protocol: &Arc<dyn Protocol>,
        request_id: corelink_proto::RequestId,
        submit: u64,
        buffer: &mut corelink_core::buffer::IoBuffer,
        callback: Box<dyn FnOnce(Result<Response, SessionError>) + Send>,
    ) -> Result<(), SessionError> {
        use parking_lot::Mutex;
        use crate::read_session::BaselineShareGuard;

        let guard_cell: Arc<Mutex<Option<BaselineShareGuard>>> = Arc::new(Mutex::new(None));
        let guard_cell_for_cb = Arc::clone(&guard_cell);
        let session = ReadSession::new_async(
            request_id,
            submit,
            None,
            Arc::clone(protocol),
            Box::new(move |outcome| {
                let _guard = guard_cell_for_cb.lock().take();
                callback(outcome_to_result(outcome));
            }),
        );

        if !socket.prepare_read(Arc::clone(&session)) {
            session.release_baseline_share();
            return Err(SessionError::SocketBusy);
        }
        *guard_cell.lock() = Some(session.baseline_guard());

        if let Err(err) = socket.write(buffer, 1) {
            session.notify(NotifyInput::Failed(err));
        }
        Ok(())
    }
}

fn outcome_to_result(outcome: crate::read_session::Outcome) -> Result<Response, SessionError> {
    match outcome.response {
        Some(response) => Ok(response),
        None => Err(outcome.error),
    }
}
