//! E1 — Bolt happy path: a single request/response round trip against
//! an echo server returns the same payload back with a success status.

mod support;

use corelink::prelude::*;

#[test]
fn bolt_request_round_trips_through_echo_server() {
    let (addr, _served) = support::spawn_bolt_echo_server();
    corelink::global_init();

    let endpoint = EndPoint::new(addr);
    let channel = Channel::init(
        endpoint,
        ChannelOptions::default(),
        corelink::reactor_pool(),
        corelink::socket_manager(),
        corelink::global_timer(),
    )
    .expect("channel init");

    let request = Request {
        service: "hello".to_string(),
        method: "ping".to_string(),
        headers: Vec::new(),
        payload: b"x".to_vec(),
    };

    let response = Session::send(request)
        .to(channel)
        .timeout_ms(500)
        .sync()
        .expect("send should succeed");

    assert_eq!(response.status, 0);
    assert_eq!(response.payload, b"x");
}
