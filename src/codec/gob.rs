use std::io::{self, BufRead, ErrorKind, Write};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use log::error;

use super::{CodecRead, CodecWrite, Header};

// Record layout
// len(u64) + payload([u8; len])
//
// bincode is not self-delimiting, so every record carries its own length.

// max record len
const RECORD_MAX_LEN: u64 = 1024 * 1024;

/// Read half of the default binary codec.
pub struct GobReader<R> {
    reader: R,
}

impl<R: BufRead> GobReader<R> {
    pub fn new(reader: R) -> Self {
        GobReader { reader }
    }

    fn read_record(&mut self) -> io::Result<Vec<u8>> {
        let len = self.reader.read_u64::<BigEndian>()?;
        if len > RECORD_MAX_LEN {
            let s = format!("decode too big record length. len={len}");
            error!("{s}");
            return Err(io::Error::new(ErrorKind::InvalidInput, s));
        }
        let mut data = vec![0u8; len as usize];
        self.reader.read_exact(&mut data)?;
        Ok(data)
    }
}

impl<R: BufRead + Send> CodecRead for GobReader<R> {
    fn read_header(&mut self, header: &mut Header) -> io::Result<()> {
        let data = self.read_record()?;
        *header = bincode::deserialize(&data)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(())
    }

    fn read_body(&mut self) -> io::Result<Vec<u8>> {
        self.read_record()
    }
}

/// Write half of the default binary codec.
///
/// Frames are staged into one buffer and pushed to the stream with a single
/// write, so a frame never interleaves with a concurrent writer's bytes.
pub struct GobWriter<W> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write> GobWriter<W> {
    pub fn new(writer: W) -> Self {
        GobWriter {
            writer,
            buf: BytesMut::with_capacity(1024 * 4),
        }
    }

    fn put_record(&mut self, data: &[u8]) {
        self.buf.put_u64(data.len() as u64);
        self.buf.extend_from_slice(data);
    }
}

impl<W: Write + Send> CodecWrite for GobWriter<W> {
    fn write(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        let head = bincode::serialize(header)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        self.put_record(&head);
        self.put_record(body);
        let ret = self.writer.write_all(&self.buf).and_then(|_| self.writer.flush());
        self.buf.clear();
        ret
    }
}
