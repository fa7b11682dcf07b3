//! The HTTP/2 connection engine.
//!
//! One long-lived reader task per connection owns the read half and
//! dispatches frames into shared state; writes are serialized through an
//! async mutex over the write half. Senders blocked on flow control park
//! on a notifier that fires whenever any window grows.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use super::codec::{FramedRead, FramedWrite, RecvError};
use super::flow::{Scope, WindowCounter, WindowStrategy};
use super::frame::{Frame, Pseudo, Settings};
use super::{
    hpack, H2Error, Reason, CLIENT_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};
use crate::body::ChunkSource;
use crate::error::{Error, Result};
use crate::proto::ResponseHead;
use crate::runner::{task_fn, TaskQueue, TaskRunner};
use crate::upgrade::Io;

type BoxIo = Box<dyn Io>;
type Writer = Arc<tokio::sync::Mutex<FramedWrite<WriteHalf<BoxIo>>>>;

/// Engine knobs, filled in from the client configuration.
pub(crate) struct Config {
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) strategy: Arc<dyn WindowStrategy>,
    pub(crate) runner: TaskRunner,
}

/// A handle to a live HTTP/2 connection. Cheap to clone; the pool holds
/// one and every in-flight exchange holds one.
#[derive(Clone)]
pub(crate) struct Http2Connection {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    writer: Writer,
    /// Fires whenever a send window grows or the connection dies.
    window_notify: Notify,
    strategy: Arc<dyn WindowStrategy>,
    ping_queue: TaskQueue,
}

struct State {
    streams: HashMap<u32, StreamSlot>,
    next_stream_id: u32,
    /// Streams that are not yet fully closed.
    open: usize,
    closed: Option<CloseCause>,
    goaway_sent: bool,
    goaway_received: Option<(u32, Reason)>,
    ping_outstanding: bool,

    // Peer-announced parameters.
    peer_initial_window: u32,
    peer_max_frame: u32,
    peer_max_concurrent: Option<u32>,

    // Send-side flow control. May go negative when the peer shrinks
    // INITIAL_WINDOW_SIZE.
    conn_send_window: i64,

    // Receive-side accounting.
    conn_recv: WindowCounter,
    conn_received: u64,
}

#[derive(Clone, Debug)]
enum CloseCause {
    Protocol(Reason),
    Io(std::io::ErrorKind, String),
    PingTimeout,
}

impl CloseCause {
    fn to_error(&self) -> Error {
        match self {
            CloseCause::Protocol(reason) => Error::new_h2(H2Error::connection(*reason)),
            CloseCause::Io(kind, msg) => Error::new_io(std::io::Error::new(*kind, msg.clone())),
            CloseCause::PingTimeout => Error::new_io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "http2 ping was not acknowledged in time",
            )),
        }
    }
}

struct StreamSlot {
    send_window: i64,
    recv: WindowCounter,
    received: u64,
    /// Bytes handed to the stream's source but not yet pulled out of it.
    pending_consume: u64,
    local_closed: bool,
    remote_closed: bool,
    response_tx: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: Option<mpsc::UnboundedSender<Result<Bytes>>>,
}

impl StreamSlot {
    fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }

    fn fail(&mut self, err: impl Fn() -> Error) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(err()));
        }
        if let Some(tx) = self.body_tx.take() {
            let _ = tx.send(Err(err()));
        }
        self.local_closed = true;
        self.remote_closed = true;
    }
}

impl Http2Connection {
    /// Sends the connection preface and spins up the reader task.
    pub(crate) async fn handshake(io: BoxIo, config: Config) -> Result<Http2Connection> {
        let (read_half, write_half) = tokio::io::split(io);

        let mut writer = FramedWrite::new(write_half);
        let settings = Settings {
            enable_push: Some(false),
            initial_window_size: Some(CLIENT_WINDOW_SIZE),
            header_table_size: Some(hpack::DEFAULT_HEADER_TABLE_SIZE as u32),
            ..Settings::default()
        };
        writer.send_preface(&settings).await.map_err(Error::new_io)?;
        // The connection window is not touched by SETTINGS; grow it to the
        // advertised size explicitly.
        writer
            .send_window_update(0, CLIENT_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE)
            .await
            .map_err(Error::new_io)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                streams: HashMap::new(),
                next_stream_id: 1,
                open: 0,
                closed: None,
                goaway_sent: false,
                goaway_received: None,
                ping_outstanding: false,
                peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
                peer_max_frame: DEFAULT_MAX_FRAME_SIZE,
                peer_max_concurrent: None,
                conn_send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
                conn_recv: WindowCounter::new(),
                conn_received: 0,
            }),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            window_notify: Notify::new(),
            strategy: config.strategy,
            ping_queue: config.runner.new_queue("h2 ping"),
        });

        let reader = FramedRead::new(read_half, hpack::DEFAULT_HEADER_TABLE_SIZE);
        tokio::spawn(read_loop(shared.clone(), reader));

        if let Some(interval) = config.ping_interval {
            let weak = Arc::downgrade(&shared);
            shared.ping_queue.schedule(
                task_fn("h2 ping watchdog", move || ping_watchdog(&weak, interval)),
                interval,
            );
        }

        Ok(Http2Connection { shared })
    }

    pub(crate) fn is_closed(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.closed.is_some() || state.goaway_received.is_some() || state.goaway_sent
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.shared.state.lock().unwrap().open
    }

    /// The peer's `MAX_CONCURRENT_STREAMS`, or effectively-unlimited.
    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .peer_max_concurrent
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
    }

    /// Sends GOAWAY and refuses new local streams. In-flight streams run
    /// to completion.
    pub(crate) async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.goaway_sent || state.closed.is_some() {
                return;
            }
            state.goaway_sent = true;
        }
        let mut writer = self.shared.writer.lock().await;
        if let Err(err) = writer.send_go_away(0, Reason::NO_ERROR).await {
            debug!("goaway write failed: {}", err);
        }
        self.shared.ping_queue.shutdown();
    }

    /// Opens a stream and writes its request headers.
    ///
    /// Fields must already be lowercased, pseudo-headers first.
    pub(crate) async fn new_stream(
        &self,
        fields: Vec<(Bytes, Bytes, bool)>,
        end_stream: bool,
    ) -> Result<H2Stream> {
        let (id, response_rx, body_rx) = {
            let mut state = self.shared.state.lock().unwrap();
            if let Some(cause) = &state.closed {
                return Err(cause.to_error());
            }
            if state.goaway_sent || state.goaway_received.is_some() {
                // Refused locally: safe for the caller to retry elsewhere.
                return Err(Error::new_h2(H2Error::stream(0, Reason::REFUSED_STREAM)));
            }
            let id = state.next_stream_id;
            state.next_stream_id += 2;

            let (response_tx, response_rx) = oneshot::channel();
            let (body_tx, body_rx) = mpsc::unbounded_channel();
            let send_window = i64::from(state.peer_initial_window);
            state.streams.insert(
                id,
                StreamSlot {
                    send_window,
                    recv: WindowCounter::new(),
                    received: 0,
                    pending_consume: 0,
                    local_closed: end_stream,
                    remote_closed: false,
                    response_tx: Some(response_tx),
                    body_tx: Some(body_tx),
                },
            );
            state.open += 1;
            (id, response_rx, body_rx)
        };

        trace!("opening stream {}", id);
        let result = {
            let mut writer = self.shared.writer.lock().await;
            writer
                .send_headers(
                    id,
                    fields.iter().map(|(n, v, s)| (&n[..], &v[..], *s)),
                    end_stream,
                )
                .await
        };
        if let Err(err) = result {
            self.shared.release_stream(id, false);
            return Err(Error::new_io(err));
        }

        Ok(H2Stream {
            shared: self.shared.clone(),
            id,
            response_rx: Some(response_rx),
            body_rx: Some(body_rx),
            local_closed: end_stream,
        })
    }
}

/// One client-initiated stream, held by the exchange.
pub(crate) struct H2Stream {
    shared: Arc<Shared>,
    id: u32,
    response_rx: Option<oneshot::Receiver<Result<ResponseHead>>>,
    body_rx: Option<mpsc::UnboundedReceiver<Result<Bytes>>>,
    local_closed: bool,
}

impl fmt::Debug for H2Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Stream").field("id", &self.id).finish()
    }
}

impl H2Stream {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Writes request body bytes, waiting on flow control as needed.
    pub(crate) async fn send_data(&mut self, mut data: Bytes, end_stream: bool) -> Result<()> {
        debug_assert!(!self.local_closed, "send_data after END_STREAM");
        if data.is_empty() {
            if end_stream {
                self.local_closed = true;
                self.shared.mark_local_closed(self.id);
                let mut writer = self.shared.writer.lock().await;
                return writer
                    .send_data(self.id, Bytes::new(), true)
                    .await
                    .map_err(Error::new_body_write);
            }
            return Ok(());
        }

        while !data.is_empty() {
            // Sender may transmit up to min(connection window, stream
            // window), clamped to the peer's frame size.
            let n = self.reserve_send_window(data.len()).await?;
            let chunk = data.split_to(n);
            let end = end_stream && data.is_empty();
            if end {
                self.local_closed = true;
                self.shared.mark_local_closed(self.id);
            }
            let mut writer = self.shared.writer.lock().await;
            writer
                .send_data(self.id, chunk, end)
                .await
                .map_err(Error::new_body_write)?;
        }
        Ok(())
    }

    async fn reserve_send_window(&self, want: usize) -> Result<usize> {
        loop {
            let notified = self.shared.window_notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(cause) = &state.closed {
                    return Err(cause.to_error());
                }
                let max_frame = state.peer_max_frame as usize;
                let conn_window = state.conn_send_window;
                let slot = state
                    .streams
                    .get_mut(&self.id)
                    .ok_or_else(|| Error::new_h2(H2Error::stream(self.id, Reason::CANCEL)))?;
                let available = std::cmp::min(conn_window, slot.send_window);
                if available > 0 {
                    let n = std::cmp::min(available as usize, std::cmp::min(want, max_frame));
                    slot.send_window -= n as i64;
                    state.conn_send_window -= n as i64;
                    return Ok(n);
                }
                trace!("stream {} blocked on flow control", self.id);
            }
            notified.await;
        }
    }

    /// Waits for the final response head; interim `1xx` heads are
    /// swallowed by the engine.
    pub(crate) async fn read_response(&mut self) -> Result<ResponseHead> {
        let rx = self
            .response_rx
            .take()
            .expect("read_response called twice");
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.close_error()),
        }
    }

    /// Converts into the response body source.
    pub(crate) fn into_body(mut self) -> StreamBody {
        StreamBody {
            shared: self.shared.clone(),
            id: self.id,
            rx: self.body_rx.take().expect("into_body called twice"),
            done: false,
        }
    }

    /// Abruptly terminates the stream (call cancellation).
    pub(crate) fn reset(&self, reason: Reason) {
        self.shared.reset_stream(self.id, reason);
    }
}

impl Drop for H2Stream {
    fn drop(&mut self) {
        // If the body was taken, the StreamBody owns cleanup.
        if self.body_rx.is_some() {
            self.shared.release_stream(self.id, true);
        }
    }
}

/// The response body source for one stream. Consuming chunks releases
/// receive-window per the engine's strategy.
pub(crate) struct StreamBody {
    shared: Arc<Shared>,
    id: u32,
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    done: bool,
}

impl ChunkSource for StreamBody {
    fn next_chunk(
        &mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Bytes>>> + Send + '_>>
    {
        Box::pin(async move {
            if self.done {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(Ok(chunk)) => {
                    self.shared.consumed(self.id, chunk.len() as u64).await;
                    Ok(Some(chunk))
                }
                Some(Err(err)) => {
                    self.done = true;
                    Err(err)
                }
                None => {
                    self.done = true;
                    Ok(None)
                }
            }
        })
    }
}

impl Drop for StreamBody {
    fn drop(&mut self) {
        self.shared.release_stream(self.id, !self.done);
    }
}

impl Shared {
    fn close_error(&self) -> Error {
        let state = self.state.lock().unwrap();
        match &state.closed {
            Some(cause) => cause.to_error(),
            None => Error::new_closed(),
        }
    }

    fn mark_local_closed(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.streams.get_mut(&id) {
            let was_closed = slot.is_closed();
            slot.local_closed = true;
            if !was_closed && slot.is_closed() {
                state.open = state.open.saturating_sub(1);
            }
        }
    }

    /// Fails a stream locally and tells the peer with RST_STREAM.
    fn reset_stream(&self, id: u32, reason: Reason) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.streams.get_mut(&id) {
                let was_closed = slot.is_closed();
                slot.fail(|| Error::new_h2(H2Error::stream(id, reason)));
                if !was_closed {
                    state.open = state.open.saturating_sub(1);
                }
            }
        }
        self.spawn_reset_frame(id, reason);
        self.window_notify.notify_waiters();
    }

    /// Final stream cleanup: releases leftover connection window for
    /// bytes that were buffered but never consumed, and resets the stream
    /// if the peer still thinks it is open.
    fn release_stream(&self, id: u32, abort: bool) {
        let (leftover_release, needs_reset) = {
            let mut state = self.state.lock().unwrap();
            let slot = match state.streams.remove(&id) {
                Some(slot) => slot,
                None => return,
            };
            if !slot.is_closed() {
                state.open = state.open.saturating_sub(1);
            }
            let needs_reset = abort && !slot.is_closed() && state.closed.is_none();
            // Unconsumed bytes count against the shared window; hand them
            // back as consumed-at-teardown.
            let leftover = slot.pending_consume;
            let release = if leftover > 0 {
                let release = self.strategy.on_consume(
                    Scope::Connection,
                    &mut state.conn_recv,
                    CLIENT_WINDOW_SIZE,
                    leftover as u32,
                );
                if release > 0 {
                    state.conn_recv.acknowledge(release);
                }
                release
            } else {
                0
            };
            (release, needs_reset)
        };

        if needs_reset {
            self.spawn_reset_frame(id, Reason::CANCEL);
        }
        if leftover_release > 0 {
            self.spawn_window_update(0, leftover_release as u32);
        }
    }

    fn spawn_reset_frame(&self, id: u32, reason: Reason) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            if let Err(err) = writer.send_reset(id, reason).await {
                debug!("reset write failed: {}", err);
            }
        });
    }

    fn spawn_window_update(&self, id: u32, increment: u32) {
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            if let Err(err) = writer.send_window_update(id, increment).await {
                debug!("window update write failed: {}", err);
            }
        });
    }

    /// Consume-side accounting for one chunk pulled by the application.
    async fn consumed(&self, id: u32, len: u64) {
        let (conn_release, stream_release) = {
            let mut state = self.state.lock().unwrap();
            let conn_release = {
                let release = self.strategy.on_consume(
                    Scope::Connection,
                    &mut state.conn_recv,
                    CLIENT_WINDOW_SIZE,
                    len as u32,
                );
                if release > 0 {
                    state.conn_recv.acknowledge(release);
                }
                release
            };
            let stream_release = match state.streams.get_mut(&id) {
                Some(slot) => {
                    slot.pending_consume = slot.pending_consume.saturating_sub(len);
                    let release = self.strategy.on_consume(
                        Scope::Stream,
                        &mut slot.recv,
                        CLIENT_WINDOW_SIZE,
                        len as u32,
                    );
                    if release > 0 {
                        slot.recv.acknowledge(release);
                    }
                    release
                }
                None => 0,
            };
            (conn_release, stream_release)
        };

        if conn_release > 0 || stream_release > 0 {
            let mut writer = self.writer.lock().await;
            if conn_release > 0 {
                let _ = writer.send_window_update(0, conn_release as u32).await;
            }
            if stream_release > 0 {
                let _ = writer.send_window_update(id, stream_release as u32).await;
            }
        }
    }
}

/// If the previous PING went unanswered, the peer is gone; otherwise send
/// the next one and come back in `interval`.
fn ping_watchdog(weak: &Weak<Shared>, interval: Duration) -> Option<Duration> {
    let shared = weak.upgrade()?;
    let outstanding = {
        let mut state = shared.state.lock().unwrap();
        if state.closed.is_some() || state.goaway_sent {
            return None;
        }
        std::mem::replace(&mut state.ping_outstanding, true)
    };

    if outstanding {
        warn!("http2 ping timeout; failing connection");
        fail_conn(&shared, CloseCause::PingTimeout);
        return None;
    }

    let writer = shared.writer.clone();
    tokio::spawn(async move {
        let mut writer = writer.lock().await;
        if let Err(err) = writer.send_ping(*b"squall..", false).await {
            debug!("ping write failed: {}", err);
        }
    });
    Some(interval)
}

async fn read_loop(shared: Arc<Shared>, mut reader: FramedRead<ReadHalf<BoxIo>>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if let Err(err) = handle_frame(&shared, &mut reader, frame).await {
                    match err {
                        RecvError::Stream { id, reason } => {
                            debug!("stream {} error: {}", id, reason);
                            shared.reset_stream(id, reason);
                        }
                        RecvError::Connection(reason) => {
                            debug!("connection error: {}", reason);
                            goaway_and_fail(&shared, reason).await;
                            return;
                        }
                        RecvError::Io(err) => {
                            fail_conn(&shared, CloseCause::Io(err.kind(), err.to_string()));
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                trace!("connection EOF");
                fail_conn(
                    &shared,
                    CloseCause::Io(std::io::ErrorKind::UnexpectedEof, "peer closed".into()),
                );
                return;
            }
            Err(RecvError::Stream { id, reason }) => {
                debug!("stream {} receive error: {}", id, reason);
                shared.reset_stream(id, reason);
            }
            Err(RecvError::Connection(reason)) => {
                goaway_and_fail(&shared, reason).await;
                return;
            }
            Err(RecvError::Io(err)) => {
                fail_conn(&shared, CloseCause::Io(err.kind(), err.to_string()));
                return;
            }
        }
    }
}

async fn goaway_and_fail(shared: &Arc<Shared>, reason: Reason) {
    let last = {
        let state = shared.state.lock().unwrap();
        state.next_stream_id.saturating_sub(2)
    };
    {
        let mut writer = shared.writer.lock().await;
        let _ = writer.send_go_away(last, reason).await;
    }
    fail_conn(shared, CloseCause::Protocol(reason));
}

fn fail_conn(shared: &Arc<Shared>, cause: CloseCause) {
    {
        let mut state = shared.state.lock().unwrap();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(cause.clone());
        for (_, slot) in state.streams.iter_mut() {
            slot.fail(|| cause.to_error());
        }
        state.open = 0;
    }
    shared.window_notify.notify_waiters();
    shared.ping_queue.shutdown();
}

async fn handle_frame(
    shared: &Arc<Shared>,
    reader: &mut FramedRead<ReadHalf<BoxIo>>,
    frame: Frame,
) -> std::result::Result<(), RecvError> {
    match frame {
        Frame::Settings(settings) => {
            apply_settings(shared, reader, settings).await?;
            let mut writer = shared.writer.lock().await;
            writer.send_settings_ack().await.map_err(RecvError::Io)?;
        }
        Frame::SettingsAck => {
            trace!("peer acknowledged our settings");
        }
        Frame::Ping { ack, payload } => {
            if ack {
                shared.state.lock().unwrap().ping_outstanding = false;
            } else {
                let mut writer = shared.writer.lock().await;
                writer.send_ping(payload, true).await.map_err(RecvError::Io)?;
            }
        }
        Frame::WindowUpdate {
            stream_id,
            increment,
        } => {
            {
                let mut state = shared.state.lock().unwrap();
                if stream_id == 0 {
                    let new = state.conn_send_window + i64::from(increment);
                    if new > i64::from(MAX_WINDOW_SIZE) {
                        return Err(RecvError::Connection(Reason::FLOW_CONTROL_ERROR));
                    }
                    state.conn_send_window = new;
                } else if let Some(slot) = state.streams.get_mut(&stream_id) {
                    let new = slot.send_window + i64::from(increment);
                    if new > i64::from(MAX_WINDOW_SIZE) {
                        return Err(RecvError::Stream {
                            id: stream_id,
                            reason: Reason::FLOW_CONTROL_ERROR,
                        });
                    }
                    slot.send_window = new;
                }
            }
            shared.window_notify.notify_waiters();
        }
        Frame::Data {
            stream_id,
            data,
            flow_len,
            end_stream,
        } => {
            handle_data(shared, stream_id, data, flow_len, end_stream).await?;
        }
        Frame::Headers {
            stream_id,
            pseudo,
            fields,
            end_stream,
        } => {
            handle_headers(shared, stream_id, pseudo, fields, end_stream)?;
        }
        Frame::Reset { stream_id, reason } => {
            {
                let mut state = shared.state.lock().unwrap();
                if let Some(slot) = state.streams.get_mut(&stream_id) {
                    debug!("stream {} reset by peer: {}", stream_id, reason);
                    let was_closed = slot.is_closed();
                    slot.fail(|| Error::new_h2(H2Error::stream(stream_id, reason)));
                    if !was_closed {
                        state.open = state.open.saturating_sub(1);
                    }
                }
            }
            shared.window_notify.notify_waiters();
        }
        Frame::GoAway {
            last_stream_id,
            reason,
        } => {
            debug!("goaway received: last={} reason={}", last_stream_id, reason);
            {
                let mut state = shared.state.lock().unwrap();
                state.goaway_received = Some((last_stream_id, reason));
                // Streams the peer never processed are safe to retry.
                let refused: Vec<u32> = state
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for id in refused {
                    if let Some(slot) = state.streams.get_mut(&id) {
                        let was_closed = slot.is_closed();
                        slot.fail(|| Error::new_h2(H2Error::stream(id, Reason::REFUSED_STREAM)));
                        if !was_closed {
                            state.open = state.open.saturating_sub(1);
                        }
                    }
                }
            }
            shared.window_notify.notify_waiters();
        }
    }
    Ok(())
}

async fn apply_settings(
    shared: &Arc<Shared>,
    reader: &mut FramedRead<ReadHalf<BoxIo>>,
    settings: Settings,
) -> std::result::Result<(), RecvError> {
    {
        let mut state = shared.state.lock().unwrap();
        if let Some(initial) = settings.initial_window_size {
            // Raising or lowering INITIAL_WINDOW_SIZE retroactively
            // adjusts every open stream window by the delta.
            let delta = i64::from(initial) - i64::from(state.peer_initial_window);
            state.peer_initial_window = initial;
            for slot in state.streams.values_mut() {
                let new = slot.send_window + delta;
                if new > i64::from(MAX_WINDOW_SIZE) {
                    return Err(RecvError::Connection(Reason::FLOW_CONTROL_ERROR));
                }
                slot.send_window = new;
            }
        }
        if let Some(max_frame) = settings.max_frame_size {
            state.peer_max_frame = max_frame;
        }
        if let Some(max_concurrent) = settings.max_concurrent_streams {
            state.peer_max_concurrent = Some(max_concurrent);
        }
    }
    if settings.max_frame_size.is_some() || settings.header_table_size.is_some() {
        let mut writer = shared.writer.lock().await;
        if let Some(max_frame) = settings.max_frame_size {
            reader.set_max_frame_size(max_frame);
            writer.set_max_frame_size(max_frame);
        }
        if let Some(table_size) = settings.header_table_size {
            writer.hpack_mut().set_max_size(table_size as usize);
        }
    }
    shared.window_notify.notify_waiters();
    Ok(())
}

async fn handle_data(
    shared: &Arc<Shared>,
    stream_id: u32,
    data: Bytes,
    flow_len: u32,
    end_stream: bool,
) -> std::result::Result<(), RecvError> {
    let window = CLIENT_WINDOW_SIZE;
    let strategy = shared.strategy.clone();

    let (conn_release, stream_release) = {
        let mut state = shared.state.lock().unwrap();

        state.conn_received += u64::from(flow_len);
        if state.conn_received - state.conn_recv.acknowledged() > u64::from(window) {
            return Err(RecvError::Connection(Reason::FLOW_CONTROL_ERROR));
        }
        let mut conn_release = {
            let release =
                strategy.on_frame(Scope::Connection, &mut state.conn_recv, window, flow_len);
            if release > 0 {
                state.conn_recv.acknowledge(release);
            }
            release
        };

        if stream_id % 2 == 0 || stream_id >= state.next_stream_id {
            // DATA for a stream that was never opened.
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }

        let stream_release = if let Some(slot) = state.streams.get_mut(&stream_id) {
            if slot.remote_closed {
                return Err(RecvError::Stream {
                    id: stream_id,
                    reason: Reason::STREAM_CLOSED,
                });
            }
            slot.received += u64::from(flow_len);
            if slot.received - slot.recv.acknowledged() > u64::from(window) {
                return Err(RecvError::Stream {
                    id: stream_id,
                    reason: Reason::FLOW_CONTROL_ERROR,
                });
            }
            let release = strategy.on_frame(Scope::Stream, &mut slot.recv, window, flow_len);
            if release > 0 {
                slot.recv.acknowledge(release);
            }

            if !data.is_empty() {
                slot.pending_consume += data.len() as u64;
                if let Some(tx) = &slot.body_tx {
                    let _ = tx.send(Ok(data.clone()));
                }
            }
            if end_stream {
                let was_closed = slot.is_closed();
                slot.remote_closed = true;
                slot.body_tx = None;
                if !was_closed && slot.is_closed() {
                    state.open = state.open.saturating_sub(1);
                }
            }

            // Padding bytes are never handed to the application; count
            // them as consumed right away.
            let padding = u64::from(flow_len) - data.len() as u64;
            if padding > 0 {
                let release = strategy.on_consume(
                    Scope::Connection,
                    &mut state.conn_recv,
                    window,
                    padding as u32,
                );
                if release > 0 {
                    state.conn_recv.acknowledge(release);
                    conn_release += release;
                }
            }
            release
        } else {
            // A recently reset stream: discard the data, but its bytes
            // still occupied the shared window. Release whatever the
            // strategy hasn't already counted.
            let uncounted = std::cmp::min(
                u64::from(flow_len),
                state.conn_received - state.conn_recv.total(),
            );
            if uncounted > 0 {
                state.conn_recv.add_total(uncounted);
                state.conn_recv.acknowledge(uncounted);
                conn_release += uncounted;
            }
            0
        };

        (conn_release, stream_release)
    };

    if conn_release > 0 || stream_release > 0 {
        let mut writer = shared.writer.lock().await;
        if conn_release > 0 {
            writer
                .send_window_update(0, conn_release as u32)
                .await
                .map_err(RecvError::Io)?;
        }
        if stream_release > 0 {
            writer
                .send_window_update(stream_id, stream_release as u32)
                .await
                .map_err(RecvError::Io)?;
        }
    }
    Ok(())
}

fn handle_headers(
    shared: &Arc<Shared>,
    stream_id: u32,
    pseudo: Pseudo,
    fields: http::HeaderMap,
    end_stream: bool,
) -> std::result::Result<(), RecvError> {
    let mut state = shared.state.lock().unwrap();
    if stream_id % 2 == 0 || stream_id >= state.next_stream_id {
        // HEADERS on a stream this client never opened.
        return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
    }
    let slot = match state.streams.get_mut(&stream_id) {
        Some(slot) => slot,
        // Late headers for a reset stream are ignored.
        None => return Ok(()),
    };
    if slot.remote_closed {
        return Err(RecvError::Stream {
            id: stream_id,
            reason: Reason::STREAM_CLOSED,
        });
    }

    match pseudo.status {
        Some(status) if status.is_informational() && !end_stream => {
            // Interim responses are swallowed; the exchange only sees the
            // final head.
            trace!("interim response {} on stream {}", status, stream_id);
        }
        Some(status) => {
            let head = ResponseHead {
                version: http::Version::HTTP_2,
                status,
                headers: fields,
            };
            if let Some(tx) = slot.response_tx.take() {
                let _ = tx.send(Ok(head));
            }
        }
        None => {
            if slot.response_tx.is_some() {
                // The first header block of a response must carry :status.
                return Err(RecvError::Stream {
                    id: stream_id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            // Trailers; dropped, like the HTTP/1 codec drops them.
        }
    }

    if end_stream {
        let was_closed = slot.is_closed();
        slot.remote_closed = true;
        slot.body_tx = None;
        if !was_closed && slot.is_closed() {
            state.open = state.open.saturating_sub(1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::{self as frame, Head, Kind, HEADER_LEN};
    use crate::proto::h2::ReleaseOnConsume;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config() -> Config {
        Config {
            ping_interval: None,
            strategy: Arc::new(ReleaseOnConsume),
            runner: TaskRunner::new(),
        }
    }

    /// A minimal scripted server over the duplex transport.
    struct TestPeer {
        io: DuplexStream,
        buf: BytesMut,
    }

    impl TestPeer {
        fn new(io: DuplexStream) -> TestPeer {
            TestPeer {
                io,
                buf: BytesMut::new(),
            }
        }

        async fn expect_preface(&mut self) {
            let mut preface = vec![0u8; PREFACE_LEN];
            self.io.read_exact(&mut preface).await.unwrap();
            assert_eq!(&preface[..], super::super::PREFACE);
            // Send our SETTINGS and ack theirs later.
            let mut buf = BytesMut::new();
            Settings::default().encode(&mut buf);
            self.io.write_all(&buf).await.unwrap();
        }

        async fn read_head(&mut self) -> (Head, Bytes) {
            while self.buf.len() < HEADER_LEN {
                if self.io.read_buf(&mut self.buf).await.unwrap() == 0 {
                    panic!("peer eof");
                }
            }
            let head = Head::parse(&self.buf[..HEADER_LEN]);
            let total = HEADER_LEN + head.length as usize;
            while self.buf.len() < total {
                self.io.read_buf(&mut self.buf).await.unwrap();
            }
            let _ = self.buf.split_to(HEADER_LEN);
            let payload = self.buf.split_to(head.length as usize).freeze();
            (head, payload)
        }

        async fn send(&mut self, bytes: &[u8]) {
            self.io.write_all(bytes).await.unwrap();
        }
    }

    const PREFACE_LEN: usize = 24;

    async fn connect() -> (Http2Connection, TestPeer) {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let conn = Http2Connection::handshake(Box::new(client), config())
            .await
            .unwrap();
        let mut peer = TestPeer::new(server);
        peer.expect_preface().await;
        // The client's SETTINGS and conn WINDOW_UPDATE arrive first,
        // followed by the ack of our SETTINGS.
        let (head, _) = peer.read_head().await;
        assert_eq!(head.kind, Kind::Settings);
        let (head, _) = peer.read_head().await;
        assert_eq!(head.kind, Kind::WindowUpdate);
        let (head, _) = peer.read_head().await;
        assert_eq!(head.kind, Kind::Settings);
        assert!(head.is_ack());
        (conn, peer)
    }

    fn response_headers(stream_id: u32, end_stream: bool) -> BytesMut {
        // :status 200 via the static table, no dynamic state needed.
        let mut block = BytesMut::new();
        block.extend_from_slice(&[0x88]);
        let mut out = BytesMut::new();
        let flags = frame::END_HEADERS | if end_stream { frame::END_STREAM } else { 0 };
        Head::encode(Kind::Headers, flags, stream_id, block.len(), &mut out);
        out.extend_from_slice(&block);
        out
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (conn, mut peer) = connect().await;

        let fields: Vec<(Bytes, Bytes, bool)> = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET"), false),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https"), false),
            (Bytes::from_static(b":authority"), Bytes::from_static(b"a.example.test"), false),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/"), false),
        ];
        let mut stream = conn.new_stream(fields, true).await.unwrap();
        assert_eq!(stream.id(), 1);

        let (head, _) = peer.read_head().await;
        assert_eq!(head.kind, Kind::Headers);
        assert!(head.is_end_stream());

        // Respond 200 with a small body.
        peer.send(&response_headers(1, false)).await;
        let mut data = BytesMut::new();
        Head::encode(Kind::Data, frame::END_STREAM, 1, 5, &mut data);
        data.extend_from_slice(b"hello");
        peer.send(&data).await;

        let response = stream.read_response().await.unwrap();
        assert_eq!(response.status, http::StatusCode::OK);

        let mut body = stream.into_body();
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flow_control_blocks_and_resumes() {
        let (conn, mut peer) = connect().await;

        // Shrink the stream window to 1024 via SETTINGS.
        let mut settings = BytesMut::new();
        Settings {
            initial_window_size: Some(1024),
            ..Settings::default()
        }
        .encode(&mut settings);
        peer.send(&settings).await;
        // Wait for the client's SETTINGS ack.
        loop {
            let (head, _) = peer.read_head().await;
            if head.kind == Kind::Settings && head.is_ack() {
                break;
            }
        }

        let fields: Vec<(Bytes, Bytes, bool)> = vec![(
            Bytes::from_static(b":method"),
            Bytes::from_static(b"POST"),
            false,
        )];
        let mut stream = conn.new_stream(fields, false).await.unwrap();
        let (head, _) = peer.read_head().await;
        assert_eq!(head.kind, Kind::Headers);

        // 4096 bytes against a 1024-byte window: expect three stalls.
        let send = tokio::spawn(async move {
            stream
                .send_data(Bytes::from(vec![0xAB; 4096]), true)
                .await
                .unwrap();
            stream
        });

        let mut received = 0usize;
        let mut updates = 0usize;
        while received < 4096 {
            let (head, payload) = peer.read_head().await;
            match head.kind {
                Kind::Data => {
                    received += payload.len();
                    if received < 4096 {
                        // Open the stream window another notch.
                        let mut wu = BytesMut::new();
                        frame::encode_window_update(1, 1024, &mut wu);
                        peer.send(&wu).await;
                        updates += 1;
                    }
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, 4096);
        assert!(updates >= 3, "expected at least three window updates, saw {}", updates);
        let _stream = send.await.unwrap();
    }

    #[tokio::test]
    async fn goaway_fails_higher_streams_as_retryable() {
        let (conn, mut peer) = connect().await;

        let fields = |path: &'static str| -> Vec<(Bytes, Bytes, bool)> {
            vec![(
                Bytes::from_static(b":path"),
                Bytes::from_static(path.as_bytes()),
                false,
            )]
        };
        let mut s1 = conn.new_stream(fields("/one"), true).await.unwrap();
        let mut s3 = conn.new_stream(fields("/two"), true).await.unwrap();
        let _ = peer.read_head().await;
        let _ = peer.read_head().await;

        // The peer processed stream 1 but refuses stream 3.
        let mut goaway = BytesMut::new();
        frame::encode_go_away(1, Reason::NO_ERROR, &mut goaway);
        peer.send(&goaway).await;
        peer.send(&response_headers(1, true)).await;

        let response = s1.read_response().await.unwrap();
        assert_eq!(response.status, http::StatusCode::OK);

        let err = s3.read_response().await.unwrap_err();
        assert_eq!(err.h2_reason(), Reason::REFUSED_STREAM);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn window_counter_invariant_under_consumption() {
        let (conn, mut peer) = connect().await;

        let mut stream = conn
            .new_stream(
                vec![(Bytes::from_static(b":method"), Bytes::from_static(b"GET"), false)],
                true,
            )
            .await
            .unwrap();
        let _ = peer.read_head().await;
        peer.send(&response_headers(1, false)).await;

        // Push data and consume it; every WINDOW_UPDATE the peer sees
        // must stay within what was sent.
        let payload = vec![0x5A; 8192];
        let mut data = BytesMut::new();
        Head::encode(Kind::Data, 0, 1, payload.len(), &mut data);
        data.extend_from_slice(&payload);
        peer.send(&data).await;
        let mut end = BytesMut::new();
        Head::encode(Kind::Data, frame::END_STREAM, 1, 0, &mut end);
        peer.send(&end).await;

        let _ = stream.read_response().await.unwrap();
        let mut body = stream.into_body();
        let mut total = 0;
        while let Some(chunk) = body.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 8192);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_watchdog_fails_silent_peer() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let conn = Http2Connection::handshake(
            Box::new(client),
            Config {
                ping_interval: Some(Duration::from_secs(5)),
                strategy: Arc::new(ReleaseOnConsume),
                runner: TaskRunner::new(),
            },
        )
        .await
        .unwrap();
        let mut peer = TestPeer::new(server);
        peer.expect_preface().await;

        // Never answer pings; after two intervals the connection fails.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let err = conn
            .new_stream(
                vec![(Bytes::from_static(b":method"), Bytes::from_static(b"GET"), false)],
                true,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
