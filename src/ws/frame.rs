//! RFC 6455 frame reader and writer.

use std::io;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub(crate) const OP_CONTINUATION: u8 = 0x0;
pub(crate) const OP_TEXT: u8 = 0x1;
pub(crate) const OP_BINARY: u8 = 0x2;
pub(crate) const OP_CLOSE: u8 = 0x8;
pub(crate) const OP_PING: u8 = 0x9;
pub(crate) const OP_PONG: u8 = 0xa;

/// Control frames fit in a single small frame.
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close reasons must leave room for the 2-byte code.
pub(crate) const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// A single parsed frame, payload already unmasked.
#[derive(Debug, PartialEq)]
pub(crate) struct Frame {
    pub(crate) fin: bool,
    pub(crate) rsv1: bool,
    pub(crate) opcode: u8,
    pub(crate) payload: Bytes,
}

impl Frame {
    pub(crate) fn is_control(&self) -> bool {
        self.opcode & 0x8 != 0
    }
}

/// Validates a close code against the registered ranges: `[1000, 5000)`
/// minus the reserved `[1004, 1006]` and `[1015, 2999]` blocks.
pub(crate) fn is_valid_close_code(code: u16) -> bool {
    match code {
        1004..=1006 | 1015..=2999 => false,
        1000..=4999 => true,
        _ => false,
    }
}

/// Reads frames off the inbound half.
///
/// The reader walks `await-header -> await-extended-length ->
/// await-mask-key -> await-payload` per frame; each state is one exact
/// read on the buffered transport.
pub(crate) struct FrameReader<R> {
    io: R,
    /// Clients require unmasked frames from the server.
    is_client: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(io: R, is_client: bool) -> FrameReader<R> {
        FrameReader { io, is_client }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame> {
        let mut head = [0u8; 2];
        self.io
            .read_exact(&mut head)
            .await
            .map_err(map_eof)?;

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        if head[0] & 0x30 != 0 {
            return Err(Error::new_websocket("reserved flags rsv2/rsv3 set"));
        }
        let opcode = head[0] & 0x0f;
        match opcode {
            OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG => {}
            other => {
                return Err(Error::new_websocket(format!("unknown opcode {:#x}", other)));
            }
        }

        let masked = head[1] & 0x80 != 0;
        if self.is_client && masked {
            return Err(Error::new_websocket("server frames must not be masked"));
        }
        if !self.is_client && !masked {
            return Err(Error::new_websocket("client frames must be masked"));
        }

        let len7 = (head[1] & 0x7f) as u64;
        let is_control = opcode & 0x8 != 0;
        if is_control {
            if len7 > MAX_CONTROL_PAYLOAD as u64 {
                return Err(Error::new_websocket("control frame payload too long"));
            }
            if !fin {
                return Err(Error::new_websocket("control frames must not be fragmented"));
            }
            if rsv1 {
                return Err(Error::new_websocket("control frames must not be compressed"));
            }
        }

        let payload_len = match len7 {
            126 => {
                let mut ext = [0u8; 2];
                self.io.read_exact(&mut ext).await.map_err(map_eof)?;
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                self.io.read_exact(&mut ext).await.map_err(map_eof)?;
                let len = u64::from_be_bytes(ext);
                if len & (1 << 63) != 0 {
                    return Err(Error::new_websocket("frame length high bit set"));
                }
                len
            }
            n => n,
        };

        let mask = if masked {
            let mut key = [0u8; 4];
            self.io.read_exact(&mut key).await.map_err(map_eof)?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len as usize];
        self.io
            .read_exact(&mut payload)
            .await
            .map_err(map_eof)?;
        if let Some(key) = mask {
            toggle_mask(&key, &mut payload);
        }

        Ok(Frame {
            fin,
            rsv1,
            opcode,
            payload: Bytes::from(payload),
        })
    }
}

fn map_eof(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::new_incomplete()
    } else {
        Error::new_io(err)
    }
}

/// Writes frames onto the outbound half.
pub(crate) struct FrameWriter<W> {
    io: W,
    /// Clients mask every frame with a fresh random key.
    is_client: bool,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(io: W, is_client: bool) -> FrameWriter<W> {
        FrameWriter { io, is_client }
    }

    pub(crate) async fn write_frame(
        &mut self,
        opcode: u8,
        payload: &[u8],
        fin: bool,
        rsv1: bool,
    ) -> Result<()> {
        if opcode & 0x8 != 0 {
            debug_assert!(fin && !rsv1 && payload.len() <= MAX_CONTROL_PAYLOAD);
        }

        let mut buf = BytesMut::with_capacity(payload.len() + 14);
        let mut b0 = opcode;
        if fin {
            b0 |= 0x80;
        }
        if rsv1 {
            b0 |= 0x40;
        }
        buf.extend_from_slice(&[b0]);

        let mask_bit = if self.is_client { 0x80 } else { 0x00 };
        if payload.len() <= 125 {
            buf.extend_from_slice(&[mask_bit | payload.len() as u8]);
        } else if payload.len() <= u16::MAX as usize {
            buf.extend_from_slice(&[mask_bit | 126]);
            buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&[mask_bit | 127]);
            buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }

        if self.is_client {
            // A fresh key per frame, from the OS's entropy.
            let mut key = [0u8; 4];
            rand::rngs::OsRng.fill_bytes(&mut key);
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(payload);
            toggle_mask(&key, &mut buf[start..]);
        } else {
            buf.extend_from_slice(payload);
        }

        self.io.write_all(&buf).await.map_err(Error::new_io)?;
        self.io.flush().await.map_err(Error::new_io)
    }

    /// Serializes and writes a close frame.
    pub(crate) async fn write_close(&mut self, code: u16, reason: &str) -> Result<()> {
        if !is_valid_close_code(code) {
            return Err(Error::new_websocket(format!("invalid close code {}", code)));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(Error::new_websocket("close reason too long"));
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.write_frame(OP_CLOSE, &payload, true, false).await
    }
}

fn toggle_mask(key: &[u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Parses a close frame payload into `(code, reason)`.
pub(crate) fn parse_close(payload: &Bytes) -> Result<(u16, String)> {
    match payload.len() {
        0 => Ok((1005, String::new())),
        1 => Err(Error::new_websocket("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(Error::new_websocket(format!("invalid close code {}", code)));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| Error::new_websocket("close reason is not utf-8"))?
                .to_owned();
            Ok((code, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(opcode: u8, payload: &[u8], fin: bool, rsv1: bool) -> Frame {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut writer = FrameWriter::new(client, true);
        writer.write_frame(opcode, payload, fin, rsv1).await.unwrap();
        let mut reader = FrameReader::new(server, false);
        reader.read_frame().await.unwrap()
    }

    #[tokio::test]
    async fn frame_round_trip_modulo_masking() {
        let frame = round_trip(OP_TEXT, b"hello", true, false).await;
        assert_eq!(
            frame,
            Frame {
                fin: true,
                rsv1: false,
                opcode: OP_TEXT,
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[tokio::test]
    async fn extended_lengths_round_trip() {
        let medium = vec![0x42u8; 126];
        let frame = round_trip(OP_BINARY, &medium, true, false).await;
        assert_eq!(frame.payload.len(), 126);

        let large = vec![0x42u8; 70_000];
        let frame = round_trip(OP_BINARY, &large, true, false).await;
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[tokio::test]
    async fn close_frame_wire_format() {
        // close(1000, "bye") = 0x88 len(5), then (after unmasking)
        // 03 E8 'b' 'y' 'e'.
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client, true);
        writer.write_close(1000, "bye").await.unwrap();

        let mut raw = [0u8; 11];
        let mut server = server;
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw[0], 0x88);
        assert_eq!(raw[1], 0x80 | 0x05);
        let mut key = [0u8; 4];
        key.copy_from_slice(&raw[2..6]);
        let mut payload = raw[6..].to_vec();
        toggle_mask(&key, &mut payload);
        assert_eq!(&payload, &[0x03, 0xE8, b'b', b'y', b'e']);
    }

    #[tokio::test]
    async fn server_rejects_unmasked_client_frames() {
        let (client, server) = tokio::io::duplex(1024);
        // Write as if we were a server (unmasked)...
        let mut writer = FrameWriter::new(client, false);
        writer.write_frame(OP_TEXT, b"x", true, false).await.unwrap();
        // ...and parse as a server expecting client masking.
        let mut reader = FrameReader::new(server, false);
        assert!(reader.read_frame().await.is_err());
    }

    #[test]
    fn close_code_ranges() {
        assert!(is_valid_close_code(1000));
        assert!(is_valid_close_code(1003));
        assert!(is_valid_close_code(1007));
        assert!(is_valid_close_code(1014));
        assert!(is_valid_close_code(3000));
        assert!(is_valid_close_code(4999));
        assert!(!is_valid_close_code(999));
        assert!(!is_valid_close_code(1004));
        assert!(!is_valid_close_code(1005));
        assert!(!is_valid_close_code(1006));
        assert!(!is_valid_close_code(1015));
        assert!(!is_valid_close_code(2999));
        assert!(!is_valid_close_code(5000));
    }

    #[tokio::test]
    async fn fragmented_control_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        // A hand-rolled non-final ping: fin=0, opcode=0x9, masked, len 1.
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            &[0x09, 0x81, 0x00, 0x00, 0x00, 0x00, b'x'],
        )
        .await
        .unwrap();
        let mut reader = FrameReader::new(server, false);
        assert!(reader.read_frame().await.unwrap_err().is_protocol());
    }
}
