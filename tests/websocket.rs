use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, PartialEq)]
enum WsEvent {
    Open,
    Text(String),
    Closing(u16, String),
    Closed(u16, String),
    Failure(String),
}

struct Recorder {
    tx: std_mpsc::Sender<WsEvent>,
}

impl squall::ws::Listener for Recorder {
    fn on_open(&self, _ws: &squall::ws::WebSocket, _response: &squall::Response) {
        let _ = self.tx.send(WsEvent::Open);
    }

    fn on_text(&self, _ws: &squall::ws::WebSocket, text: String) {
        let _ = self.tx.send(WsEvent::Text(text));
    }

    fn on_closing(&self, _ws: &squall::ws::WebSocket, code: u16, reason: &str) {
        let _ = self.tx.send(WsEvent::Closing(code, reason.to_owned()));
    }

    fn on_closed(&self, _ws: &squall::ws::WebSocket, code: u16, reason: &str) {
        let _ = self.tx.send(WsEvent::Closed(code, reason.to_owned()));
    }

    fn on_failure(&self, _ws: &squall::ws::WebSocket, error: squall::Error) {
        let _ = self.tx.send(WsEvent::Failure(error.to_string()));
    }
}

fn accept_value(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

async fn read_ws_handshake(sock: &mut tokio::net::TcpStream) -> String {
    let mut raw = Vec::new();
    loop {
        let mut buf = [0u8; 1024];
        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0);
        raw.extend_from_slice(&buf[..n]);
        if raw.windows(4).any(|w| w == b"\r\n\r\n") {
            return String::from_utf8(raw).unwrap();
        }
    }
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        if n.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

/// Reads one frame from a client socket, returning (opcode, unmasked
/// payload, raw header bytes).
async fn read_client_frame(sock: &mut tokio::net::TcpStream) -> (u8, Vec<u8>, [u8; 2]) {
    let mut head = [0u8; 2];
    sock.read_exact(&mut head).await.unwrap();
    let opcode = head[0] & 0x0f;
    assert!(head[1] & 0x80 != 0, "client frames must be masked");
    let len = (head[1] & 0x7f) as usize;
    assert!(len < 126, "test frames stay small");
    let mut mask = [0u8; 4];
    sock.read_exact(&mut mask).await.unwrap();
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    (opcode, payload, head)
}

async fn write_server_frame(sock: &mut tokio::net::TcpStream, opcode: u8, payload: &[u8]) {
    let mut frame = vec![0x80 | opcode, payload.len() as u8];
    frame.extend_from_slice(payload);
    sock.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn websocket_echo_and_close_handshake() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let head = read_ws_handshake(&mut sock).await;
        assert!(head.starts_with("GET /chat HTTP/1.1\r\n"));
        assert_eq!(header_value(&head, "upgrade"), Some("websocket"));
        assert_eq!(header_value(&head, "sec-websocket-version"), Some("13"));
        let key = header_value(&head, "sec-websocket-key").expect("key").to_owned();

        // No extensions accepted: plain frames only.
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_value(&key)
        );
        sock.write_all(response.as_bytes()).await.unwrap();

        // Echo one text message.
        let (opcode, payload, _) = read_client_frame(&mut sock).await;
        assert_eq!(opcode, 0x1);
        assert_eq!(payload, b"hello there");
        write_server_frame(&mut sock, 0x1, &payload).await;

        // Close handshake: client first.
        let (opcode, payload, head) = read_client_frame(&mut sock).await;
        assert_eq!(opcode, 0x8);
        // 0x88: FIN + close opcode; masked length 5.
        assert_eq!(head[0], 0x88);
        assert_eq!(head[1], 0x80 | 0x05);
        assert_eq!(&payload, &[0x03, 0xE8, b'b', b'y', b'e']);
        write_server_frame(&mut sock, 0x8, &[0x03, 0xE8]).await;

        // The client must not send any further frames.
        let mut buf = [0u8; 1];
        match tokio::time::timeout(std::time::Duration::from_millis(300), sock.read(&mut buf))
            .await
        {
            Ok(Ok(0)) | Err(_) => {}
            other => panic!("unexpected bytes after close: {:?}", other),
        }
    });

    let (tx, rx) = std_mpsc::channel();
    let client = squall::Client::new();
    let ws = client
        .websocket(
            squall::Request::get(format!("ws://{}/chat", addr)).build().unwrap(),
            Arc::new(Recorder { tx }),
        )
        .await
        .unwrap();

    let next = move |rx: &std_mpsc::Receiver<WsEvent>| {
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap()
    };

    assert_eq!(next(&rx), WsEvent::Open);

    ws.send_text("hello there").unwrap();
    assert_eq!(next(&rx), WsEvent::Text("hello there".to_owned()));

    ws.close(1000, "bye").unwrap();
    assert_eq!(next(&rx), WsEvent::Closing(1000, String::new()));
    assert_eq!(next(&rx), WsEvent::Closed(1000, String::new()));

    // The socket is closed; further sends are refused.
    assert!(ws.send_text("after close").is_err());

    server.await.unwrap();
}

#[tokio::test]
async fn handshake_rejects_bad_accept_header() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let _ = read_ws_handshake(&mut sock).await;
        sock.write_all(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n",
        )
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    });

    let (tx, _rx) = std_mpsc::channel();
    let client = squall::Client::new();
    let err = client
        .websocket(
            squall::Request::get(format!("ws://{}/chat", addr)).build().unwrap(),
            Arc::new(Recorder { tx }),
        )
        .await
        .unwrap_err();
    assert!(err.is_protocol(), "err: {err:?}");
}
