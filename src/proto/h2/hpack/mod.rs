//! HPACK header compression (RFC 7541).

mod huffman;
mod table;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use self::table::DynamicTable;

/// The protocol's default dynamic table capacity.
pub(crate) const DEFAULT_HEADER_TABLE_SIZE: usize = 4096;

#[derive(Debug)]
pub(crate) enum DecoderError {
    InvalidInteger,
    InvalidIndex,
    InvalidHuffman,
    InvalidUtf8,
    SizeUpdateOverLimit,
    SizeUpdateAfterFields,
    NeedMore,
}

/// Decodes header blocks, owning the inbound dynamic table.
#[derive(Debug)]
pub(crate) struct Decoder {
    table: DynamicTable,
    /// The ceiling the local SETTINGS announced; the peer's size updates
    /// may not exceed it.
    max_size: usize,
}

impl Decoder {
    pub(crate) fn new(max_size: usize) -> Decoder {
        Decoder {
            table: DynamicTable::new(max_size),
            max_size,
        }
    }

    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        if self.table.capacity() > max_size {
            self.table.set_capacity(max_size);
        }
    }

    /// Decodes one complete header block into `(name, value)` pairs.
    ///
    /// Names arrive lowercased on a conforming wire; the field validation
    /// (pseudo-header ordering and so on) is the codec's job.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<Vec<(Bytes, Bytes)>, DecoderError> {
        let mut buf = src;
        let mut fields = Vec::new();
        let mut seen_field = false;

        while !buf.is_empty() {
            let byte = buf[0];
            if byte & 0x80 == 0x80 {
                // Indexed field.
                let index = decode_integer(&mut buf, 7)?;
                let (name, value) = self
                    .table
                    .get(index as usize)
                    .ok_or(DecoderError::InvalidIndex)?;
                seen_field = true;
                fields.push((name, value));
            } else if byte & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let (name, value) = self.decode_literal(&mut buf, 6)?;
                self.table.insert(name.clone(), value.clone());
                seen_field = true;
                fields.push((name, value));
            } else if byte & 0xe0 == 0x20 {
                // Dynamic table size update: only before the first field.
                if seen_field {
                    return Err(DecoderError::SizeUpdateAfterFields);
                }
                let size = decode_integer(&mut buf, 5)? as usize;
                if size > self.max_size {
                    return Err(DecoderError::SizeUpdateOverLimit);
                }
                self.table.set_capacity(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001).
                let (name, value) = self.decode_literal(&mut buf, 4)?;
                seen_field = true;
                fields.push((name, value));
            }
        }

        Ok(fields)
    }

    fn decode_literal(
        &mut self,
        buf: &mut &[u8],
        prefix: u8,
    ) -> Result<(Bytes, Bytes), DecoderError> {
        let index = decode_integer(buf, prefix)?;
        let name = if index == 0 {
            decode_string(buf)?
        } else {
            self.table
                .get(index as usize)
                .ok_or(DecoderError::InvalidIndex)?
                .0
        };
        let value = decode_string(buf)?;
        Ok((name, value))
    }
}

/// Encodes header blocks, owning the outbound dynamic table.
///
/// Values are emitted as plain literals (no Huffman); exact and name-only
/// table matches are used where available.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: DynamicTable,
    /// Set when the peer lowered `SETTINGS_HEADER_TABLE_SIZE`; the next
    /// block must lead with a size update.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            table: DynamicTable::new(DEFAULT_HEADER_TABLE_SIZE),
            pending_size_update: None,
        }
    }

    /// Applies the peer's `SETTINGS_HEADER_TABLE_SIZE`.
    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        if max_size < self.table.capacity() {
            self.pending_size_update = Some(max_size);
            self.table.set_capacity(max_size);
        } else {
            self.table.set_capacity(max_size);
        }
    }

    /// Encodes one header block. `sensitive` fields become never-indexed
    /// literals and stay out of the table.
    pub(crate) fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8], bool)>,
    {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(0x20, 5, size as u64, dst);
        }

        for (name, value, sensitive) in fields {
            if sensitive {
                // Never indexed.
                let (_, name_index) = self.table.find(name, value);
                match name_index {
                    Some(i) => encode_integer(0x10, 4, i as u64, dst),
                    None => {
                        dst.put_u8(0x10);
                        encode_string(name, dst);
                    }
                }
                encode_string(value, dst);
                continue;
            }

            let (exact, name_index) = self.table.find(name, value);
            if let Some(i) = exact {
                encode_integer(0x80, 7, i as u64, dst);
                continue;
            }

            // Literal with incremental indexing.
            match name_index {
                Some(i) => encode_integer(0x40, 6, i as u64, dst),
                None => {
                    dst.put_u8(0x40);
                    encode_string(name, dst);
                }
            }
            encode_string(value, dst);
            self.table
                .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        }
    }
}

fn decode_integer(buf: &mut &[u8], prefix: u8) -> Result<u64, DecoderError> {
    debug_assert!((1..=8).contains(&prefix));
    if buf.is_empty() {
        return Err(DecoderError::NeedMore);
    }
    let mask = (1u16 << prefix) - 1;
    let mut value = u64::from(buf[0]) & u64::from(mask);
    buf.advance(1);
    if value < u64::from(mask) {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if buf.is_empty() {
            return Err(DecoderError::NeedMore);
        }
        let byte = buf[0];
        buf.advance(1);
        value = value
            .checked_add(u64::from(byte & 0x7f) << shift)
            .ok_or(DecoderError::InvalidInteger)?;
        shift += 7;
        if shift > 56 {
            return Err(DecoderError::InvalidInteger);
        }
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn encode_integer(pattern: u8, prefix: u8, mut value: u64, dst: &mut BytesMut) {
    let mask = (1u16 << prefix) - 1;
    if value < u64::from(mask) {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | mask as u8);
    value -= u64::from(mask);
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

fn decode_string(buf: &mut &[u8]) -> Result<Bytes, DecoderError> {
    if buf.is_empty() {
        return Err(DecoderError::NeedMore);
    }
    let huffman = buf[0] & 0x80 == 0x80;
    let len = decode_integer(buf, 7)? as usize;
    if buf.len() < len {
        return Err(DecoderError::NeedMore);
    }
    let raw = &buf[..len];
    let result = if huffman {
        let mut decoded = Vec::with_capacity(len * 2);
        huffman::decode(raw, &mut decoded).map_err(|()| DecoderError::InvalidHuffman)?;
        Bytes::from(decoded)
    } else {
        Bytes::copy_from_slice(raw)
    };
    buf.advance(len);
    Ok(result)
}

fn encode_string(value: &[u8], dst: &mut BytesMut) {
    encode_integer(0x00, 7, value.len() as u64, dst);
    dst.put_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, block: &[u8]) -> Vec<(String, String)> {
        decoder
            .decode(block)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n.to_vec()).unwrap(),
                    String::from_utf8(v.to_vec()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn integer_round_trip() {
        for &value in &[0u64, 9, 30, 31, 127, 128, 1337, 1 << 20] {
            let mut dst = BytesMut::new();
            encode_integer(0x00, 5, value, &mut dst);
            let mut buf = &dst[..];
            assert_eq!(decode_integer(&mut buf, 5).unwrap(), value);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn decodes_rfc_indexed_example() {
        // RFC 7541 C.2.4: indexed ":method: GET"
        let mut decoder = Decoder::new(4096);
        assert_eq!(
            decode_all(&mut decoder, &[0x82]),
            vec![(":method".to_owned(), "GET".to_owned())]
        );
    }

    #[test]
    fn decodes_rfc_literal_example() {
        // RFC 7541 C.2.1: literal with indexing "custom-key: custom-header"
        let block = [
            0x40, 0x0a, b'c', b'u', b's', b't', b'o', b'm', b'-', b'k', b'e', b'y', 0x0d, b'c',
            b'u', b's', b't', b'o', b'm', b'-', b'h', b'e', b'a', b'd', b'e', b'r',
        ];
        let mut decoder = Decoder::new(4096);
        assert_eq!(
            decode_all(&mut decoder, &block),
            vec![("custom-key".to_owned(), "custom-header".to_owned())]
        );
        // And the entry is now at index 62.
        assert_eq!(
            decode_all(&mut decoder, &[0xbe]),
            vec![("custom-key".to_owned(), "custom-header".to_owned())]
        );
    }

    #[test]
    fn round_trip_through_encoder() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new(4096);

        let headers: Vec<(&[u8], &[u8], bool)> = vec![
            (b":method", b"GET", false),
            (b":scheme", b"https", false),
            (b":path", b"/a/b", false),
            (b":authority", b"example.test", false),
            (b"accept", b"*/*", false),
            (b"x-custom", b"one", false),
            (b"authorization", b"Bearer secret", true),
        ];

        for _round in 0..3 {
            let mut block = BytesMut::new();
            encoder.encode(headers.iter().map(|&(n, v, s)| (n, v, s)), &mut block);
            let decoded = decoder.decode(&block).unwrap();
            assert_eq!(decoded.len(), headers.len());
            for ((dn, dv), &(n, v, _)) in decoded.iter().zip(&headers) {
                assert_eq!(&dn[..], n);
                assert_eq!(&dv[..], v);
            }
        }
    }

    #[test]
    fn sensitive_fields_stay_out_of_the_table() {
        let mut encoder = Encoder::new();
        let mut block = BytesMut::new();
        encoder.encode(
            vec![(&b"authorization"[..], &b"Bearer zzz"[..], true)],
            &mut block,
        );
        // 0x1f 0x08 is "never indexed, name = static 23 (authorization)".
        assert_eq!(block[0] & 0xf0, 0x10);
        // Encoding again must not find an exact table match (no 0x80 op).
        let mut block2 = BytesMut::new();
        encoder.encode(
            vec![(&b"authorization"[..], &b"Bearer zzz"[..], true)],
            &mut block2,
        );
        assert_eq!(block, block2);
    }

    #[test]
    fn size_update_is_enforced() {
        let mut decoder = Decoder::new(100);
        // A size update to 4096 exceeds the announced limit of 100.
        let mut block = BytesMut::new();
        encode_integer(0x20, 5, 4096, &mut block);
        assert!(matches!(
            decoder.decode(&block),
            Err(DecoderError::SizeUpdateOverLimit)
        ));
    }

    #[test]
    fn size_update_must_lead_the_block() {
        let mut decoder = Decoder::new(4096);
        let mut block = BytesMut::new();
        block.put_u8(0x82); // :method: GET
        encode_integer(0x20, 5, 0, &mut block);
        assert!(matches!(
            decoder.decode(&block),
            Err(DecoderError::SizeUpdateAfterFields)
        ));
    }
}
