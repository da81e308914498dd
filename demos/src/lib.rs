//! Tiny blocking echo servers the `demos/src/bin/*` programs dial into.
//!
//! These are stand-ins for a real Bolt/HTTP peer, not part of the
//! `corelink` public surface — grounded on the same shape as the
//! teacher's own standalone example servers (accept loop on a
//! background thread, one worker thread per connection), kept in
//! plain `std::net` since a demo harness has no business pulling in
//! the reactor it is testing against.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

const BOLT_HEADER_LEN: usize = 22;
const BOLT_DIRECTION_RESPONSE: u8 = 0;
const BOLT_CMD_HEARTBEAT: u16 = 0;

/// Starts a background thread that accepts Bolt connections on an
/// ephemeral loopback port and echoes every request frame back with a
/// success status, including heartbeats. Returns the bound address.
pub fn spawn_bolt_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    thread::Builder::new()
        .name("demo-bolt-server".to_string())
        .spawn(move || {
            for stream in listener.incoming().flatten() {
                thread::spawn(move || serve_bolt_connection(stream));
            }
        })
        .expect("spawn bolt server thread");
    addr
}

fn serve_bolt_connection(mut stream: TcpStream) {
    loop {
        let mut header = [0u8; BOLT_HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let cmdcode = u16::from_be_bytes([header[2], header[3]]);
        let request_id = [header[5], header[6], header[7], header[8]];

        if cmdcode == BOLT_CMD_HEARTBEAT {
            let mut response = header;
            response[1] = BOLT_DIRECTION_RESPONSE;
            if stream.write_all(&response).is_err() {
                return;
            }
            continue;
        }

        let class_len = u16::from_be_bytes([header[10], header[11]]) as usize;
        let header_len = u16::from_be_bytes([header[12], header[13]]) as usize;
        let content_len = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
        let mut body = vec![0u8; class_len + header_len + content_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        // Echo the request straight back as a response: same sizes,
        // same payload bytes, status forced to Success (0).
        let mut response = Vec::with_capacity(BOLT_HEADER_LEN + body.len());
        response.push(header[0]); // protocol type
        response.push(BOLT_DIRECTION_RESPONSE);
        response.extend_from_slice(&2u16.to_be_bytes()); // CMD_RESPONSE
        response.push(header[4]); // ver2
        response.extend_from_slice(&request_id);
        response.push(header[9]); // codec
        response.extend_from_slice(&0u16.to_be_bytes()); // status: success
        response.extend_from_slice(&(class_len as u16).to_be_bytes());
        response.extend_from_slice(&(header_len as u16).to_be_bytes());
        response.extend_from_slice(&(content_len as u32).to_be_bytes());
        response.extend_from_slice(&body);

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

/// Starts a background thread that accepts HTTP/1.1 connections on an
/// ephemeral loopback port and replies `200 OK` with the request body
/// echoed back, once per pipelined request, in arrival order.
pub fn spawn_http_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    thread::Builder::new()
        .name("demo-http-server".to_string())
        .spawn(move || {
            for stream in listener.incoming().flatten() {
                thread::spawn(move || serve_http_connection(stream));
            }
        })
        .expect("spawn http server thread");
    addr
}

fn serve_http_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let header_end = loop {
            if let Some(pos) = find_double_crlf(&buf) {
                break pos;
            }
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        };

        let content_length = parse_content_length(&buf[..header_end]);
        let total = header_end + content_length;
        while buf.len() < total {
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        }

        let body = buf[header_end..total].to_vec();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        );
        if stream.write_all(response.as_bytes()).is_err() || stream.write_all(&body).is_err() {
            return;
        }
        buf.drain(..total);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_content_length(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}
