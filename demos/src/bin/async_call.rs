//! A single asynchronous Bolt call: the callback fires from whichever
//! reactor thread matches the response frame.

use corelink::prelude::*;
use corelink_demos::spawn_bolt_echo_server;
use std::sync::mpsc;

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
        payload: b"hello from async_call".to_vec(),
    };

    let (tx, rx) = mpsc::channel();
    Session::send(request)
        .to(channel)
        .timeout_ms(500)
        .send_async(move |result| {
            let _ = tx.send(result);
        })
        .expect("async send submission");

    match rx.recv_timeout(std::time::Duration::from_secs(2)) {
        Ok(Ok(response)) => println!(
            "status={} payload={}",
            response.status,
            String::from_utf8_lossy(&response.payload)
        ),
        Ok(Err(err)) => eprintln!("send failed: {err}"),
        Err(_) => eprintln!("callback never fired"),
    }
}
