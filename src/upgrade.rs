//! HTTP Upgrades.
//!
//! When a response carries `101 Switching Protocols`, the exchange hands
//! its connection over to the caller through the response's [`OnUpgrade`]
//! extension instead of reading a body. WebSockets are built on this.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A transport that was speaking HTTP until the upgrade.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// An upgraded connection, plus whatever bytes the HTTP machinery had
/// already read past the response head.
pub struct Upgraded {
    io: Box<dyn Io>,
    read_buf: Bytes,
}

/// A future for a possible HTTP upgrade.
pub struct OnUpgrade {
    rx: Option<oneshot::Receiver<Result<Upgraded>>>,
}

pub(crate) struct Pending {
    tx: oneshot::Sender<Result<Upgraded>>,
}

/// Creates the two halves of an upgrade handoff.
pub(crate) fn pending() -> (Pending, OnUpgrade) {
    let (tx, rx) = oneshot::channel();
    (Pending { tx }, OnUpgrade { rx: Some(rx) })
}

impl Upgraded {
    pub(crate) fn new(io: Box<dyn Io>, read_buf: Bytes) -> Upgraded {
        Upgraded { io, read_buf }
    }

    /// Splits into the raw transport and the already-read bytes.
    ///
    /// Check `read_buf`: the server may have sent the first bytes of the
    /// new protocol together with the `101` response.
    pub fn into_parts(self) -> (Box<dyn Io>, Bytes) {
        (self.io, self.read_buf)
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = std::cmp::min(self.read_buf.len(), buf.remaining());
            buf.put_slice(&self.read_buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("read_buf", &self.read_buf.len())
            .finish()
    }
}

impl OnUpgrade {
    /// An `OnUpgrade` that never resolves with a connection.
    pub(crate) fn none() -> OnUpgrade {
        OnUpgrade { rx: None }
    }

    /// Waits for the upgrade to complete.
    pub async fn upgraded(self) -> Result<Upgraded> {
        match self.rx {
            Some(rx) => rx.await.map_err(|_| Error::new_canceled())?,
            None => Err(Error::new_user_no_upgrade()),
        }
    }
}

impl fmt::Debug for OnUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnUpgrade").finish()
    }
}

impl Pending {
    pub(crate) fn fulfill(self, upgraded: Upgraded) {
        let _ = self.tx.send(Ok(upgraded));
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish()
    }
}
