// Per-message compression codecs.
//
// The codec is negotiated during IDENTIFY and carried per message as a
// one-byte ordinal on the wire. Snappy uses the framed format, Deflate the
// zlib container, matching what the broker side expects.
use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    #[default]
    None,
    Snappy,
    Deflate,
}

impl CompressType {
    /// Wire ordinal carried in message frames and the IDENTIFY body.
    pub fn ordinal(self) -> u8 {
        match self {
            CompressType::None => 0,
            CompressType::Snappy => 1,
            CompressType::Deflate => 2,
        }
    }

    /// Decode a wire ordinal; out-of-range values fall back to `None`
    /// rather than failing the frame.
    pub fn from_ordinal(value: u8) -> Self {
        match value {
            1 => CompressType::Snappy,
            2 => CompressType::Deflate,
            _ => CompressType::None,
        }
    }

    /// Compress a whole buffer.
    pub fn compress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            CompressType::None => Ok(data.to_vec()),
            CompressType::Snappy => {
                let mut encoder = FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                encoder.into_inner().map_err(|err| err.into_error())
            }
            CompressType::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }

    /// Decompress a whole buffer.
    pub fn decompress(self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader(Bytes::copy_from_slice(data))
            .read_to_end(&mut out)?;
        Ok(out)
    }

    /// Decompressing reader over an owned message body.
    pub fn reader(self, body: Bytes) -> Box<dyn Read + Send> {
        let cursor = io::Cursor::new(body);
        match self {
            CompressType::None => Box::new(cursor),
            CompressType::Snappy => Box::new(FrameDecoder::new(cursor)),
            CompressType::Deflate => Box::new(ZlibDecoder::new(cursor)),
        }
    }
}

/// Run `callback` against a compressing writer that appends to `out`,
/// finishing the codec afterwards. Returns the number of (compressed) bytes
/// appended to `out`.
pub(crate) fn write_through<F>(
    out: &mut bytes::BytesMut,
    compress: CompressType,
    callback: F,
) -> io::Result<usize>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let start = out.len();
    match compress {
        CompressType::None => {
            let mut sink = BufSink(out);
            callback(&mut sink)?;
        }
        CompressType::Snappy => {
            let mut encoder = FrameEncoder::new(BufSink(out));
            callback(&mut encoder)?;
            encoder.into_inner().map_err(|err| err.into_error())?;
        }
        CompressType::Deflate => {
            let mut encoder = ZlibEncoder::new(BufSink(out), flate2::Compression::default());
            callback(&mut encoder)?;
            encoder.finish()?;
        }
    }
    Ok(out.len() - start)
}

// io::Write adapter appending to a BytesMut.
struct BufSink<'a>(&'a mut bytes::BytesMut);

impl Write for BufSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
