use std::io::Write;

use tracing::debug;
use zstd::stream::write::Encoder;

use crate::error::Error;

/// zstd level used for the payload blocks.
pub const DEFAULT_LEVEL: i32 = 19;

/// Extra-stream bytes are handed to the sink at most this many at a time.
pub(crate) const EXTRA_CHUNK: usize = 1 << 30;

/// Add-stream delta bytes are staged through a buffer of this size.
pub(crate) const ADD_CHUNK: usize = 4096;

/// One append-only compressed output stream.
///
/// Each of the three delta payloads (instruction, add, extra) gets its own
/// sink; `finish` hands the caller the compressed bytes.
pub struct BlockSink {
    enc: Encoder<'static, Vec<u8>>,
    raw: u64,
}

impl BlockSink {
    pub fn new(level: i32) -> Result<Self, Error> {
        let enc = Encoder::new(Vec::new(), level)?;
        Ok(Self { enc, raw: 0 })
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.enc.write_all(buf)?;
        self.raw += buf.len() as u64;
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>, Error> {
        let out = self.enc.finish()?;
        debug!(raw = self.raw, compressed = out.len(), "closed block");
        Ok(out)
    }
}

/// Append one signed offset in the instruction wire format: seven
/// little-endian magnitude bytes, then a byte carrying the sign in the high
/// bit and the top magnitude byte in the low seven.
pub fn put_off(sink: &mut BlockSink, off: i64) -> Result<(), Error> {
    sink.write(&encode_off(off))
}

pub(crate) fn encode_off(off: i64) -> [u8; 8] {
    let sign = if off < 0 { 0x80 } else { 0 };
    let mut mag = off.unsigned_abs();
    let mut b = [0u8; 8];
    for slot in b.iter_mut().take(7) {
        *slot = mag as u8;
        mag >>= 8;
    }
    b[7] = sign | (mag as u8 & 0x7f);
    b
}

pub(crate) fn decode_off(b: &[u8; 8]) -> i64 {
    let mut mag = (b[7] & 0x7f) as u64;
    for &byte in b[..7].iter().rev() {
        mag = mag << 8 | byte as u64;
    }
    if b[7] & 0x80 != 0 {
        -(mag as i64)
    } else {
        mag as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_trip() {
        let cases = [
            0i64,
            1,
            -1,
            127,
            -128,
            300,
            -4096,
            1 << 40,
            -(1 << 40),
            (1 << 55) - 1,
            -((1 << 55) - 1),
        ];
        for v in cases {
            assert_eq!(decode_off(&encode_off(v)), v, "offset {v}");
        }
    }

    #[test]
    fn sign_lives_in_the_top_bit() {
        assert_eq!(encode_off(5), [5, 0, 0, 0, 0, 0, 0, 0]);
        let b = encode_off(-2);
        assert_eq!(b[0], 2);
        assert_eq!(b[7], 0x80);
        let b = encode_off(0x0102);
        assert_eq!(&b[..3], &[0x02, 0x01, 0]);
    }

    #[test]
    fn sink_round_trips_through_zstd() {
        let mut sink = BlockSink::new(DEFAULT_LEVEL).unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        let blob = sink.finish().unwrap();
        assert_eq!(zstd::stream::decode_all(&blob[..]).unwrap(), b"hello world");
    }

    #[test]
    fn empty_sink_still_yields_a_decodable_block() {
        let blob = BlockSink::new(DEFAULT_LEVEL).unwrap().finish().unwrap();
        assert!(zstd::stream::decode_all(&blob[..]).unwrap().is_empty());
    }
}
