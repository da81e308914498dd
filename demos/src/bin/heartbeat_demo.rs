//! Demonstrates the socket manager's idle heartbeat: configure a low
//! idle threshold and tick interval, make one call, then sit idle and
//! watch the manager heartbeat the connection (visible via logging).

use corelink::prelude::*;
use corelink::{LogLevel, RuntimeOptions};
use corelink_demos::spawn_bolt_echo_server;
use std::thread;
use std::time::Duration;

fn main() {
    let addr = spawn_bolt_echo_server();

    let options = RuntimeOptions {
        socket_idle_threshold_us: 200_000,
        manager_tick_ms: 250,
        ..RuntimeOptions::default()
    };
    corelink::global_init_with_options(&options);
    corelink::set_log_level(LogLevel::Debug);

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
        payload: b"warm up the connection".to_vec(),
    };
    Session::send(request).to(channel).sync().expect("initial call");

    println!("connection idle, watching for heartbeats for 3 seconds...");
    thread::sleep(Duration::from_secs(3));
    println!("done; check logs above for periodic heartbeat ok/fail lines");
}
