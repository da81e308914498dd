//! Pipelines several HTTP requests over one Channel and joins on all
//! of them, printing each leg's outcome in submission order.

use corelink::prelude::*;
use corelink_demos::spawn_http_echo_server;

fn main() {
    let addr = spawn_http_echo_server();
    corelink::global_init();

    let endpoint = EndPoint::new(addr);
    let options = ChannelOptions::default().protocol(ProtocolKind::Http);
    let channel = Channel::init(
        endpoint,
        options,
        corelink::reactor_pool(),
        corelink::socket_manager(),
        corelink::global_timer(),
    )
    .expect("channel init");

    let pipeline = (0..4).fold(PipelineSession::new(), |p, i| {
        p.pipe(Request {
            service: format!("/echo/{i}"),
            method: "POST".to_string(),
            headers: Vec::new(),
            payload: format!("leg {i}").into_bytes(),
        })
    });

    let (results, diagnostic) = pipeline.to(channel).timeout_ms(500).sync();

    for (i, result) in results.iter().enumerate() {
        match result {
            Ok(response) => println!(
                "leg {i}: status={} payload={}",
                response.status,
                String::from_utf8_lossy(&response.payload)
            ),
            Err(err) => println!("leg {i}: error={err}"),
        }
    }
    if let Some(diagnostic) = diagnostic {
        eprintln!("pipeline had failures: {diagnostic}");
    }
}
