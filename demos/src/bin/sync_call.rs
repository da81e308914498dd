//! A single synchronous Bolt call against a local echo server.

use corelink::prelude::*;
use corelink_demos::spawn_bolt_echo_server;

fn main() {
    let addr = spawn_bolt_echo_server();
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
        service: "demo.Echo".to_string(),
        method: "ping".to_string(),
        headers: Vec::new(),
        payload: b"hello from sync_call".to_vec(),
    };

    let response = Session::send(request)
        .to(channel)
        .timeout_ms(500)
        .max_retry(3)
        .sync()
        .expect("sync send");

    println!(
        "status={} payload={}",
        response.status,
        String::from_utf8_lossy(&response.payload)
    );
}
