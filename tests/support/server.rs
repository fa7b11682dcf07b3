//! A scripted TCP server for exercising the client.
//!
//! Each accepted connection is fed the next script: a list of canned
//! response blobs, one written per request read. Request heads (and any
//! `Content-Length` body) are consumed and recorded so tests can assert
//! on what actually hit the wire.

#![allow(dead_code)]

use std::net;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::oneshot;

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    requests_rx: std_mpsc::Receiver<String>,
    events_rx: std_mpsc::Receiver<Event>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[derive(Debug, PartialEq)]
pub enum Event {
    ConnectionOpened,
    ConnectionClosed,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    /// The full head of the next recorded request.
    pub fn take_request(&self) -> String {
        self.requests_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no request recorded")
    }

    /// The request-target of the next recorded request.
    pub fn take_request_target(&self) -> String {
        let head = self.take_request();
        head.lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_owned()
    }

    pub fn events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn connections_opened(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Event::ConnectionOpened)
            .count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

/// Serves scripted responses: connection `i` answers its requests with
/// `scripts[i]` in order, then keeps the socket open until shutdown.
pub fn scripted(scripts: Vec<Vec<Vec<u8>>>) -> Server {
    // Spawn new runtime in thread to prevent reactor execution context
    // conflict with the test's runtime.
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async {
            tokio::net::TcpListener::bind(&net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let (requests_tx, requests_rx) = std_mpsc::channel();
        let (events_tx, events_rx) = std_mpsc::channel();
        let tname = format!("test({})-support-server", test_name);
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    let mut scripts = scripts.into_iter();
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => {
                                break;
                            }
                            accepted = listener.accept() => {
                                let (sock, _) = accepted.expect("accepted");
                                let script = scripts.next().unwrap_or_default();
                                let requests_tx = requests_tx.clone();
                                let events_tx = events_tx.clone();
                                let _ = events_tx.send(Event::ConnectionOpened);
                                tokio::spawn(async move {
                                    serve_connection(sock, script, requests_tx).await;
                                    let _ = events_tx.send(Event::ConnectionClosed);
                                });
                            }
                        }
                    }
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            requests_rx,
            events_rx,
            shutdown_tx: Some(shutdown_tx),
        }
    })
    .join()
    .unwrap()
}

async fn serve_connection(
    mut sock: TcpStream,
    script: Vec<Vec<u8>>,
    requests_tx: std_mpsc::Sender<String>,
) {
    let mut responses = script.into_iter();
    loop {
        let head = match read_request(&mut sock).await {
            Some(head) => head,
            None => return,
        };
        let _ = requests_tx.send(head);

        match responses.next() {
            Some(response) => {
                if sock.write_all(&response).await.is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

/// Reads one request head plus any `Content-Length` body.
async fn read_request(sock: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let head_len = loop {
        if let Some(pos) = find_crlf_crlf(&buf) {
            break pos + 4;
        }
        let mut chunk = [0u8; 1024];
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body_read = buf.len() - head_len;
    while body_read < content_length {
        let mut chunk = [0u8; 1024];
        match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => body_read += n,
        }
    }
    Some(head)
}

fn find_crlf_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// A canned `200 OK` with a sized body.
pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// A canned response with arbitrary status line and headers.
pub fn response(status_line: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status_line);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out.into_bytes()
}
