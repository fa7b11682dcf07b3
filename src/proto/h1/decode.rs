//! Response body decoders.

use std::fmt;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::io::Buffered;
use crate::proto::BodyLength;

use self::Kind::{Chunked, Eof, Length};

/// Maximum amount of bytes allowed in chunked extensions.
///
/// This limit is applied for the entire body, not per chunk.
const CHUNKED_EXTENSIONS_LIMIT: u64 = 1024 * 16;

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// A reader used when a Content-Length header is passed with a
    /// positive integer.
    Length(u64),
    /// A reader used when Transfer-Encoding is `chunked`.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_cnt: u64,
    },
    /// A reader used for responses that don't indicate a length or
    /// chunked.
    ///
    /// The bool tracks when EOF is seen on the transport.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::new(),
                chunk_len: 0,
                extensions_cnt: 0,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(crate) fn new(len: BodyLength) -> Decoder {
        match len {
            BodyLength::None => Decoder::length(0),
            BodyLength::Known(n) => Decoder::length(n),
            BodyLength::Chunked => Decoder::chunked(),
            BodyLength::CloseDelimited => Decoder::eof(),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | Eof(true)
        )
    }

    /// Decodes the next piece of the body. An empty chunk means the body
    /// is complete.
    pub(crate) async fn decode<T>(&mut self, body: &mut Buffered<T>) -> io::Result<Bytes>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    Ok(Bytes::new())
                } else {
                    let to_read = *remaining as usize;
                    let buf = body.read_mem(to_read).await?;
                    let num = buf.as_ref().len() as u64;
                    if num > *remaining {
                        *remaining = 0;
                    } else if num == 0 {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
                    } else {
                        *remaining -= num;
                    }
                    Ok(buf)
                }
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_cnt,
            } => {
                loop {
                    let mut buf = None;
                    // advances the chunked state
                    *state = state.step(body, chunk_len, extensions_cnt, &mut buf).await?;
                    if *state == ChunkedState::End {
                        trace!("end of chunked");
                        return Ok(Bytes::new());
                    }
                    if let Some(buf) = buf {
                        return Ok(buf);
                    }
                }
            }
            Eof(ref mut is_eof) => {
                if *is_eof {
                    Ok(Bytes::new())
                } else {
                    // 8192 chosen because its about 2 packets, there
                    // probably won't be that much available.
                    let slice = body.read_mem(8192).await?;
                    *is_eof = slice.is_empty();
                    Ok(slice)
                }
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

macro_rules! byte (
    ($rdr:ident) => ({
        match $rdr.read_byte().await? {
            Some(b) => b,
            None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                      "unexpected EOF during chunk size line")),
        }
    })
);

macro_rules! or_overflow {
    ($e:expr) => (
        match $e {
            Some(val) => val,
            None => return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk size: overflow",
            )),
        }
    )
}

impl ChunkedState {
    fn new() -> ChunkedState {
        ChunkedState::Start
    }

    async fn step<T>(
        &self,
        body: &mut Buffered<T>,
        size: &mut u64,
        extensions_cnt: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        use self::ChunkedState::*;
        match *self {
            Start => ChunkedState::read_start(body, size).await,
            Size => ChunkedState::read_size(body, size).await,
            SizeLws => ChunkedState::read_size_lws(body).await,
            Extension => ChunkedState::read_extension(body, extensions_cnt).await,
            SizeLf => ChunkedState::read_size_lf(body, *size).await,
            Body => ChunkedState::read_body(body, size, buf).await,
            BodyCr => ChunkedState::read_body_cr(body).await,
            BodyLf => ChunkedState::read_body_lf(body).await,
            Trailer => ChunkedState::read_trailer(body).await,
            TrailerLf => ChunkedState::read_trailer_lf(body).await,
            EndCr => ChunkedState::read_end_cr(body).await,
            EndLf => ChunkedState::read_end_lf(body).await,
            End => Ok(ChunkedState::End),
        }
    }

    async fn read_start<T>(rdr: &mut Buffered<T>, size: &mut u64) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Read chunk start");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: missing size digit",
                ));
            }
        }

        Ok(ChunkedState::Size)
    }

    async fn read_size<T>(rdr: &mut Buffered<T>, size: &mut u64) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Read chunk hex size");

        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b - b'0') as u64));
            }
            b @ b'a'..=b'f' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'a') as u64));
            }
            b @ b'A'..=b'F' => {
                *size = or_overflow!(size.checked_mul(radix));
                *size = or_overflow!(size.checked_add((b + 10 - b'A') as u64));
            }
            b'\t' | b' ' => return Ok(ChunkedState::SizeLws),
            b';' => return Ok(ChunkedState::Extension),
            b'\r' => return Ok(ChunkedState::SizeLf),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Invalid chunk size line: Invalid Size",
                ));
            }
        }
        Ok(ChunkedState::Size)
    }

    async fn read_size_lws<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("read_size_lws");
        match byte!(rdr) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Ok(ChunkedState::SizeLws),
            b';' => Ok(ChunkedState::Extension),
            b'\r' => Ok(ChunkedState::SizeLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size linear white space",
            )),
        }
    }

    async fn read_extension<T>(
        rdr: &mut Buffered<T>,
        extensions_cnt: &mut u64,
    ) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("read_extension");
        // We don't care about extensions really at all. Just ignore them.
        // They "end" at the next CRLF.
        //
        // However, some implementations may not check for the CR, so to be
        // safe, we disallow a lone CR or LF in the extension.
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::SizeLf),
            b'\n' => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk extension contains newline",
            )),
            _ => {
                *extensions_cnt += 1;
                if *extensions_cnt >= CHUNKED_EXTENSIONS_LIMIT {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk extensions over limit",
                    ))
                } else {
                    Ok(ChunkedState::Extension)
                }
            }
        }
    }

    async fn read_size_lf<T>(rdr: &mut Buffered<T>, size: u64) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Chunk size is {:?}", size);
        match byte!(rdr) {
            b'\n' => {
                if size == 0 {
                    Ok(ChunkedState::EndCr)
                } else {
                    Ok(ChunkedState::Body)
                }
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk size LF",
            )),
        }
    }

    async fn read_body<T>(
        rdr: &mut Buffered<T>,
        rem: &mut u64,
        buf: &mut Option<Bytes>,
    ) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Chunked read, remaining={:?}", rem);

        // cap remaining bytes at the max capacity of usize
        let rem_cap = match *rem {
            r if r > usize::MAX as u64 => usize::MAX,
            r => r as usize,
        };

        let slice = rdr.read_mem(rem_cap).await?;
        let count = slice.len();

        if count == 0 {
            *rem = 0;
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, IncompleteBody));
        }
        *buf = Some(slice);
        *rem -= count as u64;

        if *rem > 0 {
            Ok(ChunkedState::Body)
        } else {
            Ok(ChunkedState::BodyCr)
        }
    }

    async fn read_body_cr<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::BodyLf),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body CR",
            )),
        }
    }

    async fn read_body_lf<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match byte!(rdr) {
            b'\n' => Ok(ChunkedState::Start),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk body LF",
            )),
        }
    }

    async fn read_trailer<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("read_trailer");
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::TrailerLf),
            _ => Ok(ChunkedState::Trailer),
        }
    }

    async fn read_trailer_lf<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match byte!(rdr) {
            b'\n' => Ok(ChunkedState::EndCr),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid trailer end LF",
            )),
        }
    }

    async fn read_end_cr<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match byte!(rdr) {
            b'\r' => Ok(ChunkedState::EndLf),
            _ => Ok(ChunkedState::Trailer),
        }
    }

    async fn read_end_lf<T>(rdr: &mut Buffered<T>) -> io::Result<ChunkedState>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match byte!(rdr) {
            b'\n' => Ok(ChunkedState::End),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid chunk end LF",
            )),
        }
    }
}

#[derive(Debug)]
struct IncompleteBody;

impl fmt::Display for IncompleteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "end of file before message length reached")
    }
}

impl std::error::Error for IncompleteBody {}

#[cfg(test)]
mod tests {
    use super::*;

    async fn buffered_from(data: &[u8]) -> Buffered<tokio::io::DuplexStream> {
        let (client, mut server) = tokio::io::duplex(data.len().max(1) + 1);
        if !data.is_empty() {
            tokio::io::AsyncWriteExt::write_all(&mut server, data)
                .await
                .unwrap();
        }
        drop(server);
        Buffered::new(client)
    }

    async fn read_all(decoder: &mut Decoder, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut io = buffered_from(data).await;
        let mut all = Vec::new();
        loop {
            let chunk = decoder.decode(&mut io).await?;
            if chunk.is_empty() {
                return Ok(all);
            }
            all.extend_from_slice(&chunk);
        }
    }

    #[tokio::test]
    async fn length_decoder_stops_at_length() {
        let mut decoder = Decoder::length(5);
        let body = read_all(&mut decoder, b"hello more bytes").await.unwrap();
        assert_eq!(body, b"hello");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn length_decoder_requires_all_bytes() {
        let mut decoder = Decoder::length(10);
        let err = read_all(&mut decoder, b"short").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn chunked_decoder_reassembles() {
        let mut decoder = Decoder::chunked();
        let body = read_all(&mut decoder, b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(body, b"wikipedia");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn chunked_decoder_ignores_extensions() {
        let mut decoder = Decoder::chunked();
        let body = read_all(&mut decoder, b"4;ext=value\r\nwiki\r\n0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(body, b"wiki");
    }

    #[tokio::test]
    async fn chunked_decoder_skips_trailers() {
        let mut decoder = Decoder::chunked();
        let body = read_all(
            &mut decoder,
            b"4\r\nwiki\r\n0\r\nExpires: never\r\nX-More: yes\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(body, b"wiki");
        assert!(decoder.is_eof());
    }

    #[tokio::test]
    async fn chunked_decoder_rejects_bad_size() {
        let mut decoder = Decoder::chunked();
        let err = read_all(&mut decoder, b"xyz\r\n\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn eof_decoder_reads_to_close() {
        let mut decoder = Decoder::eof();
        let body = read_all(&mut decoder, b"anything goes").await.unwrap();
        assert_eq!(body, b"anything goes");
        assert!(decoder.is_eof());
    }
}
