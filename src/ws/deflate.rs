//! permessage-deflate (RFC 7692).
//!
//! Messages are run through raw DEFLATE with the shared-suffix trick: a
//! compressed message that ends in `00 00 FF FF` has those four bytes
//! stripped on the wire, and the inflater appends them back before
//! inflating. Context takeover keeps the dictionary warm between
//! messages unless the handshake negotiated it away.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The negotiated extension parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct DeflateConfig {
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_no_context_takeover: bool,
}

/// Compresses outbound message payloads.
pub(crate) struct MessageDeflater {
    compress: Compress,
    reset_between_messages: bool,
}

impl MessageDeflater {
    pub(crate) fn new(reset_between_messages: bool) -> MessageDeflater {
        MessageDeflater {
            // Raw deflate: no zlib wrapper on the wire.
            compress: Compress::new(Compression::default(), false),
            reset_between_messages,
        }
    }

    pub(crate) fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut consumed = 0usize;
        loop {
            let before_in = self.compress.total_in();
            let status = self
                .compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(Error::new_websocket)?;
            consumed += (self.compress.total_in() - before_in) as usize;
            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= data.len() && flushed(&out) {
                        break;
                    }
                    out.reserve(data.len() / 2 + 64);
                }
                Status::StreamEnd => break,
            }
        }

        if out.ends_with(&DEFLATE_TAIL) {
            out.truncate(out.len() - DEFLATE_TAIL.len());
        } else {
            out.push(0x00);
        }

        if self.reset_between_messages {
            self.compress.reset();
        }
        Ok(out)
    }
}

/// A sync flush always terminates with the empty stored block tail.
fn flushed(out: &[u8]) -> bool {
    out.ends_with(&DEFLATE_TAIL)
}

/// Decompresses inbound message payloads.
pub(crate) struct MessageInflater {
    decompress: Decompress,
    reset_between_messages: bool,
}

impl MessageInflater {
    pub(crate) fn new(reset_between_messages: bool) -> MessageInflater {
        MessageInflater {
            decompress: Decompress::new(false),
            reset_between_messages,
        }
    }

    pub(crate) fn inflate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        // Re-attach the suffix the compressor stripped.
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut out = Vec::with_capacity(data.len() * 2 + 16);
        let mut consumed = 0usize;
        while consumed < input.len() {
            let before_in = self.decompress.total_in();
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(Error::new_websocket)?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= input.len() {
                        break;
                    }
                    out.reserve(out.len() / 2 + 64);
                }
                Status::StreamEnd => break,
            }
        }

        if self.reset_between_messages {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_inflate_round_trip() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);

        for message in &[
            &b"hello deflate"[..],
            &b"hello deflate"[..], // repetition exercises context takeover
            &[0u8; 4096][..],
            &b""[..],
        ] {
            let compressed = deflater.compress(message).unwrap();
            let inflated = inflater.inflate(&compressed).unwrap();
            assert_eq!(&inflated[..], *message);
        }
    }

    #[test]
    fn no_context_takeover_resets_dictionary() {
        let mut deflater = MessageDeflater::new(true);
        let mut inflater = MessageInflater::new(true);

        let first = deflater.compress(b"repetition repetition").unwrap();
        let second = deflater.compress(b"repetition repetition").unwrap();
        // With a reset dictionary both messages compress identically.
        assert_eq!(first, second);
        assert_eq!(
            inflater.inflate(&first).unwrap(),
            b"repetition repetition"
        );
        assert_eq!(
            inflater.inflate(&second).unwrap(),
            b"repetition repetition"
        );
    }

    #[test]
    fn context_takeover_shrinks_repeated_messages() {
        let mut deflater = MessageDeflater::new(false);
        let first = deflater.compress(b"a long, repetitive payload body").unwrap();
        let second = deflater.compress(b"a long, repetitive payload body").unwrap();
        assert!(second.len() < first.len());
    }
}
