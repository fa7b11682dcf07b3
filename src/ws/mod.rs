//! WebSockets (RFC 6455) with permessage-deflate (RFC 7692).
//!
//! A socket is opened through the regular call machinery: the upgrade
//! request rides the interceptor chain, and on `101 Switching Protocols`
//! the exchange's connection is handed over. One reader task dispatches
//! incoming frames to the [`Listener`]; one writer task drains the send
//! queue; the ping watchdog lives on the client's task runner.

pub(crate) mod deflate;
pub(crate) mod frame;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use self::deflate::{DeflateConfig, MessageDeflater, MessageInflater};
use self::frame::{FrameReader, FrameWriter};
use crate::client::call::CancelHandle;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::runner::{task_fn, TaskQueue};
use crate::upgrade::{OnUpgrade, Upgraded};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

use http::header::{
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
};

/// Receives WebSocket events. All callbacks run on the socket's reader
/// task; keep them brief.
pub trait Listener: Send + Sync + 'static {
    fn on_open(&self, _ws: &WebSocket, _response: &Response) {}
    fn on_text(&self, _ws: &WebSocket, _text: String) {}
    fn on_binary(&self, _ws: &WebSocket, _data: Bytes) {}
    fn on_ping(&self, _ws: &WebSocket, _payload: Bytes) {}
    fn on_pong(&self, _ws: &WebSocket, _payload: Bytes) {}
    /// The peer initiated a close; the socket echoes it automatically.
    fn on_closing(&self, _ws: &WebSocket, _code: u16, _reason: &str) {}
    fn on_closed(&self, _ws: &WebSocket, _code: u16, _reason: &str) {}
    fn on_failure(&self, _ws: &WebSocket, _error: Error) {}
}

/// A connected WebSocket.
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

struct Inner {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state: Mutex<State>,
    cancel: CancelHandle,
    ping_queue: TaskQueue,
    awaiting_pong: AtomicBool,
}

#[derive(Default)]
struct State {
    close_enqueued: bool,
    failed: bool,
}

enum Cmd {
    Message { opcode: u8, payload: Bytes },
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

impl WebSocket {
    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Cmd::Message {
            opcode: frame::OP_TEXT,
            payload: Bytes::from(text.into()),
        })
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Cmd::Message {
            opcode: frame::OP_BINARY,
            payload: data.into(),
        })
    }

    /// Queues an unsolicited ping.
    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(Cmd::Ping(payload.into()))
    }

    /// Initiates the close handshake. No further messages may be sent.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !frame::is_valid_close_code(code) {
            return Err(Error::new_websocket(format!("invalid close code {}", code)));
        }
        if reason.len() > frame::MAX_CLOSE_REASON {
            return Err(Error::new_websocket("close reason too long"));
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.close_enqueued || state.failed {
                return Err(Error::new_user_write_after_close());
            }
            state.close_enqueued = true;
        }
        self.inner
            .cmd_tx
            .send(Cmd::Close {
                code,
                reason: reason.to_owned(),
            })
            .map_err(|_| Error::new_closed())
    }

    /// Tears the socket down immediately, without a close handshake.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        self.inner.ping_queue.shutdown();
    }

    fn send(&self, cmd: Cmd) -> Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.close_enqueued {
                return Err(Error::new_user_write_after_close());
            }
            if state.failed {
                return Err(Error::new_closed());
            }
        }
        self.inner.cmd_tx.send(cmd).map_err(|_| Error::new_closed())
    }

    fn fail(&self, err: Error, listener: &Arc<dyn Listener>) {
        let first = {
            let mut state = self.inner.state.lock().unwrap();
            !std::mem::replace(&mut state.failed, true)
        };
        if first {
            listener.on_failure(self, err);
            self.cancel();
        }
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket").finish()
    }
}

/// Performs the upgrade handshake and starts the socket's tasks.
pub(crate) async fn connect(
    client: Client,
    request: Request,
    listener: Arc<dyn Listener>,
) -> Result<WebSocket> {
    let mut key_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);
    let key = base64::engine::general_purpose::STANDARD.encode(key_bytes);

    let (method, uri, mut headers, _body, extensions) = request.into_parts();
    if method != http::Method::GET {
        return Err(Error::new_websocket("websocket upgrades use GET"));
    }
    let uri = http_equivalent_uri(&uri)?;

    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(&key).expect("base64 is a valid header value"),
    );
    headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    headers.insert(
        SEC_WEBSOCKET_EXTENSIONS,
        HeaderValue::from_static("permessage-deflate"),
    );

    let request = Request::from_parts(method, uri, headers, crate::Body::empty(), extensions);
    let mut response = client.new_call(request).execute().await?;

    verify_handshake(&response, &key)?;
    let deflate = negotiated_deflate(&response);

    let on_upgrade = response
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(Error::new_user_no_upgrade)?;
    let upgraded = on_upgrade.upgraded().await?;
    let (read_half, write_half) = tokio::io::split(upgraded);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let conf = client.conf();
    let ws = WebSocket {
        inner: Arc::new(Inner {
            cmd_tx,
            state: Mutex::new(State::default()),
            cancel: CancelHandle::new(),
            ping_queue: conf.runner.new_queue("ws ping"),
            awaiting_pong: AtomicBool::new(false),
        }),
    };

    listener.on_open(&ws, &response);

    tokio::spawn(writer_loop(
        ws.clone(),
        listener.clone(),
        write_half,
        cmd_rx,
        deflate,
    ));
    tokio::spawn(reader_loop(ws.clone(), listener.clone(), read_half, deflate));

    if let Some(interval) = conf.ping_interval {
        schedule_ping_watchdog(&ws, &listener, interval);
    }

    Ok(ws)
}

fn http_equivalent_uri(uri: &http::Uri) -> Result<http::Uri> {
    let scheme = match uri.scheme_str() {
        Some("ws") | Some("http") => "http",
        Some("wss") | Some("https") => "https",
        _ => return Err(Error::new_user_unsupported_scheme()),
    };
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(scheme.parse().expect("static scheme"));
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    http::Uri::from_parts(parts)
        .map_err(|_| Error::new(crate::error::Kind::Parse(crate::error::Parse::Uri)))
}

fn verify_handshake(response: &Response, key: &str) -> Result<()> {
    if response.status() != http::StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::new_websocket(format!(
            "expected 101 but was {}",
            response.status()
        )));
    }
    let header_is = |name: header::HeaderName, expected: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    };
    if !header_is(header::UPGRADE, "websocket") {
        return Err(Error::new_websocket("expected 'Upgrade: websocket' header"));
    }
    if !header_is(header::CONNECTION, "upgrade") {
        return Err(Error::new_websocket("expected 'Connection: Upgrade' header"));
    }

    let expected = expected_accept(key);
    let accept = response
        .headers()
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if accept != expected {
        return Err(Error::new_websocket(format!(
            "expected Sec-WebSocket-Accept {:?} but was {:?}",
            expected, accept
        )));
    }
    Ok(())
}

pub(crate) fn expected_accept(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

/// Parses the server's `Sec-WebSocket-Extensions` answer.
fn negotiated_deflate(response: &Response) -> Option<DeflateConfig> {
    let value = response
        .headers()
        .get(SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|v| v.to_str().ok())?;
    let mut config = None;
    for extension in value.split(',') {
        let mut params = extension.split(';').map(str::trim);
        if params.next() != Some("permessage-deflate") {
            continue;
        }
        let mut deflate = DeflateConfig::default();
        for param in params {
            match param {
                "client_no_context_takeover" => deflate.client_no_context_takeover = true,
                "server_no_context_takeover" => deflate.server_no_context_takeover = true,
                // Window-bit hints are advisory for a zlib-backed codec.
                other if other.starts_with("client_max_window_bits") => {}
                other if other.starts_with("server_max_window_bits") => {}
                other => {
                    debug!("unknown permessage-deflate parameter {:?}", other);
                }
            }
        }
        config = Some(deflate);
    }
    config
}

fn schedule_ping_watchdog(ws: &WebSocket, listener: &Arc<dyn Listener>, interval: Duration) {
    let weak: Weak<Inner> = Arc::downgrade(&ws.inner);
    let listener = listener.clone();
    let queue = ws.inner.ping_queue.clone();
    queue.schedule(
        task_fn("ws ping watchdog", move || {
            let inner = weak.upgrade()?;
            let ws = WebSocket { inner };
            if ws.inner.state.lock().unwrap().failed {
                return None;
            }
            if ws.inner.awaiting_pong.swap(true, Ordering::SeqCst) {
                // No pong since the previous ping: the peer is gone.
                warn!("websocket ping timeout");
                ws.fail(
                    Error::new_io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "websocket ping was not acknowledged in time",
                    )),
                    &listener,
                );
                return None;
            }
            if ws.inner.cmd_tx.send(Cmd::Ping(Bytes::new())).is_err() {
                return None;
            }
            Some(interval)
        }),
        interval,
    );
}

async fn writer_loop(
    ws: WebSocket,
    listener: Arc<dyn Listener>,
    io: WriteHalf<Upgraded>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    deflate: Option<DeflateConfig>,
) {
    let mut writer = FrameWriter::new(io, true);
    let mut deflater =
        deflate.map(|config| MessageDeflater::new(config.client_no_context_takeover));
    let cancel = ws.inner.cancel.clone();

    loop {
        let cmd = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
            _ = cancel.canceled() => return,
        };

        let result = match cmd {
            Cmd::Message { opcode, payload } => match &mut deflater {
                Some(deflater) if !payload.is_empty() => match deflater.compress(&payload) {
                    Ok(compressed) => writer.write_frame(opcode, &compressed, true, true).await,
                    Err(err) => Err(err),
                },
                _ => writer.write_frame(opcode, &payload, true, false).await,
            },
            Cmd::Ping(payload) => writer.write_frame(frame::OP_PING, &payload, true, false).await,
            Cmd::Pong(payload) => writer.write_frame(frame::OP_PONG, &payload, true, false).await,
            Cmd::Close { code, reason } => {
                let result = writer.write_close(code, &reason).await;
                if result.is_err() {
                    ws.fail(result.unwrap_err(), &listener);
                }
                // No frames follow a close.
                return;
            }
        };

        if let Err(err) = result {
            ws.fail(err, &listener);
            return;
        }
    }
}

async fn reader_loop(
    ws: WebSocket,
    listener: Arc<dyn Listener>,
    io: ReadHalf<Upgraded>,
    deflate: Option<DeflateConfig>,
) {
    let mut reader = FrameReader::new(io, true);
    let mut inflater =
        deflate.map(|config| MessageInflater::new(config.server_no_context_takeover));
    let cancel = ws.inner.cancel.clone();

    // Fragmented-message assembly.
    let mut message_opcode: Option<u8> = None;
    let mut message_compressed = false;
    let mut message_buf: Vec<u8> = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = reader.read_frame() => frame,
            _ = cancel.canceled() => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                ws.fail(err, &listener);
                return;
            }
        };

        if frame.is_control() {
            // Control frames interleave inside fragmented messages and
            // are handled the moment they arrive.
            match frame.opcode {
                frame::OP_PING => {
                    listener.on_ping(&ws, frame.payload.clone());
                    let _ = ws.inner.cmd_tx.send(Cmd::Pong(frame.payload));
                }
                frame::OP_PONG => {
                    ws.inner.awaiting_pong.store(false, Ordering::SeqCst);
                    listener.on_pong(&ws, frame.payload);
                }
                frame::OP_CLOSE => {
                    let (code, reason) = match frame::parse_close(&frame.payload) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            ws.fail(err, &listener);
                            return;
                        }
                    };
                    trace!("peer close: {} {:?}", code, reason);
                    listener.on_closing(&ws, code, &reason);
                    let already_closing = {
                        let mut state = ws.inner.state.lock().unwrap();
                        std::mem::replace(&mut state.close_enqueued, true)
                    };
                    if !already_closing {
                        let _ = ws.inner.cmd_tx.send(Cmd::Close {
                            code: if frame::is_valid_close_code(code) { code } else { 1000 },
                            reason: String::new(),
                        });
                    }
                    listener.on_closed(&ws, code, &reason);
                    ws.inner.ping_queue.shutdown();
                    return;
                }
                _ => unreachable!("is_control covers 0x8..=0xa"),
            }
            continue;
        }

        // Data frames.
        match frame.opcode {
            frame::OP_TEXT | frame::OP_BINARY => {
                if message_opcode.is_some() {
                    ws.fail(
                        Error::new_websocket("expected continuation frame"),
                        &listener,
                    );
                    return;
                }
                if frame.rsv1 && inflater.is_none() {
                    ws.fail(
                        Error::new_websocket("compressed frame without negotiated extension"),
                        &listener,
                    );
                    return;
                }
                message_opcode = Some(frame.opcode);
                message_compressed = frame.rsv1;
                message_buf.clear();
                message_buf.extend_from_slice(&frame.payload);
            }
            frame::OP_CONTINUATION => {
                if message_opcode.is_none() {
                    ws.fail(
                        Error::new_websocket("continuation without a message"),
                        &listener,
                    );
                    return;
                }
                if frame.rsv1 {
                    ws.fail(
                        Error::new_websocket("rsv1 on a continuation frame"),
                        &listener,
                    );
                    return;
                }
                message_buf.extend_from_slice(&frame.payload);
            }
            _ => unreachable!("data opcodes only"),
        }

        if !frame.fin {
            continue;
        }

        let opcode = message_opcode.take().expect("message in progress");
        let payload = if message_compressed {
            match inflater
                .as_mut()
                .expect("checked on message start")
                .inflate(&message_buf)
            {
                Ok(inflated) => inflated,
                Err(err) => {
                    ws.fail(err, &listener);
                    return;
                }
            }
        } else {
            std::mem::take(&mut message_buf)
        };

        match opcode {
            frame::OP_TEXT => match String::from_utf8(payload) {
                Ok(text) => listener.on_text(&ws, text),
                Err(_) => {
                    ws.fail(Error::new_websocket("text message is not utf-8"), &listener);
                    return;
                }
            },
            frame::OP_BINARY => listener.on_binary(&ws, Bytes::from(payload)),
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_the_rfc_accept_value() {
        // The example key from RFC 6455 §1.3.
        assert_eq!(
            expected_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_deflate_negotiation() {
        let mut response = crate::response::Response::new(
            http::StatusCode::SWITCHING_PROTOCOLS,
            http::Version::HTTP_11,
            http::HeaderMap::new(),
            crate::body::ResponseBody::empty(),
            "http://a.example.test/".parse().unwrap(),
            http::Method::GET,
            None,
            std::time::SystemTime::now(),
            std::time::SystemTime::now(),
        );
        assert_eq!(negotiated_deflate(&response), None);

        response.headers_mut().insert(
            SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate; client_no_context_takeover"),
        );
        let config = negotiated_deflate(&response).unwrap();
        assert!(config.client_no_context_takeover);
        assert!(!config.server_no_context_takeover);
    }

    #[test]
    fn ws_uris_map_to_http() {
        assert_eq!(
            http_equivalent_uri(&"ws://a.example.test/chat".parse().unwrap()).unwrap(),
            "http://a.example.test/chat"
        );
        assert_eq!(
            http_equivalent_uri(&"wss://a.example.test/chat".parse().unwrap()).unwrap(),
            "https://a.example.test/chat"
        );
    }
}
