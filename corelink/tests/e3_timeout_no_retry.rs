//! E3 — Timeout, no retry: a call against a sink that never replies
//! fails with `READ_TIMEOUT` and is not retried, since retrying a
//! timeout risks duplicating a server-side effect.

mod support;

use corelink::error::SessionError;
use corelink::prelude::*;

#[test]
fn timeout_fails_fast_without_retrying() {
    let addr = support::spawn_bolt_sink_server();
    corelink::global_init();

    let endpoint = EndPoint::new(addr);
    let options = ChannelOptions::default().timeout_ms(50).max_retry(3);
    let channel = Channel::init(
        endpoint,
        options,
        corelink::reactor_pool(),
        corelink::socket_manager(),
        corelink::global_timer(),
    )
    .expect("channel init");

    let request = Request {
        service: "hello".to_string(),
        method: "ping".to_string(),
        headers: Vec::new(),
        payload: b"never answered".to_vec(),
    };

    let started = std::time::Instant::now();
    let result = Session::send(request).to(channel).sync();
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap_err(), SessionError::ReadTimeout);
    // Three retries at 50ms each would take >= 150ms; bailing after
    // the first timeout should finish well under that.
    assert!(
        elapsed < std::time::Duration::from_millis(120),
        "timeout retried instead of failing fast: {elapsed:?}"
    );
}
