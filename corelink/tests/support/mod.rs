//! Shared helpers for the integration suites: small blocking TCP
//! servers standing in for a real Bolt/HTTP peer, and a couple of
//! wire-level parsing shortcuts the tests need to inspect frames the
//! client sent.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub const BOLT_HEADER_LEN: usize = 22;
const BOLT_DIRECTION_RESPONSE: u8 = 0;
const BOLT_CMD_HEARTBEAT: u16 = 0;

/// Accepts Bolt connections and echoes every request/heartbeat frame
/// back with a success status. Returns the bound address and a
/// shared counter of frames served, for assertions on write count.
pub fn spawn_bolt_echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let counter = Arc::clone(&counter);
            thread::spawn(move || serve_bolt_connection(stream, counter));
        }
    });
    (addr, served)
}

fn serve_bolt_connection(mut stream: TcpStream, served: Arc<AtomicUsize>) {
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
            served.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        let class_len = u16::from_be_bytes([header[10], header[11]]) as usize;
        let header_len = u16::from_be_bytes([header[12], header[13]]) as usize;
        let content_len = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
        let mut body = vec![0u8; class_len + header_len + content_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let mut response = Vec::with_capacity(BOLT_HEADER_LEN + body.len());
        response.push(header[0]);
        response.push(BOLT_DIRECTION_RESPONSE);
        response.extend_from_slice(&2u16.to_be_bytes());
        response.push(header[4]);
        response.extend_from_slice(&request_id);
        response.push(header[9]);
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&(class_len as u16).to_be_bytes());
        response.extend_from_slice(&(header_len as u16).to_be_bytes());
        response.extend_from_slice(&(content_len as u32).to_be_bytes());
        response.extend_from_slice(&body);

        if stream.write_all(&response).is_err() {
            return;
        }
        served.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accepts one connection, reads exactly one full request frame, then
/// never replies — exercises `READ_TIMEOUT`.
pub fn spawn_bolt_sink_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut header = [0u8; BOLT_HEADER_LEN];
            if stream.read_exact(&mut header).is_err() {
                return;
            }
            let class_len = u16::from_be_bytes([header[10], header[11]]) as usize;
            let header_len = u16::from_be_bytes([header[12], header[13]]) as usize;
            let content_len =
                u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
            let mut body = vec![0u8; class_len + header_len + content_len];
            let _ = stream.read_exact(&mut body);
            // Hold the connection open without ever writing back.
            thread::sleep(std::time::Duration::from_secs(5));
        }
    });
    addr
}

/// Accepts one connection, reads one request frame, then closes the
/// socket without replying — exercises write/read failure + retry.
pub fn spawn_bolt_drop_once_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut header = [0u8; BOLT_HEADER_LEN];
            if stream.read_exact(&mut header).is_err() {
                return;
            }
            let class_len = u16::from_be_bytes([header[10], header[11]]) as usize;
            let header_len = u16::from_be_bytes([header[12], header[13]]) as usize;
            let content_len =
                u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
            let mut body = vec![0u8; class_len + header_len + content_len];
            let _ = stream.read_exact(&mut body);
            // Drop the stream here: the client's next read fails.
        }
        // Second connection attempt lands here and succeeds normally.
        for stream in listener.incoming().flatten() {
            thread::spawn(move || serve_bolt_connection(stream, Arc::new(AtomicUsize::new(0))));
        }
    });
    addr
}

/// Accepts HTTP/1.1 connections and echoes each pipelined request's
/// body back as a 200 response, in the order requests arrive.
pub fn spawn_http_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || serve_http_connection(stream));
        }
    });
    addr
}

fn serve_http_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(_) => return,
            }
        };
        let content_length = {
            let text = String::from_utf8_lossy(&buf[..header_end]);
            text.lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0usize)
        };
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
