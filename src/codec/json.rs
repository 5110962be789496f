use std::io::{self, BufRead, ErrorKind, Write};

use bytes::BytesMut;

use super::{CodecRead, CodecWrite, Header};

// One compact JSON value per line. serde_json never emits a raw newline
// inside a compact value, so the line break is a safe record delimiter.

/// Read half of the JSON codec.
pub struct JsonReader<R> {
    reader: R,
    line: Vec<u8>,
}

impl<R: BufRead> JsonReader<R> {
    pub fn new(reader: R) -> Self {
        JsonReader {
            reader,
            line: Vec::with_capacity(256),
        }
    }

    fn read_record(&mut self) -> io::Result<&[u8]> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        Ok(&self.line)
    }
}

impl<R: BufRead + Send> CodecRead for JsonReader<R> {
    fn read_header(&mut self, header: &mut Header) -> io::Result<()> {
        let data = self.read_record()?;
        *header = serde_json::from_slice(data)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(())
    }

    fn read_body(&mut self) -> io::Result<Vec<u8>> {
        self.read_record().map(|d| d.to_vec())
    }
}

/// Write half of the JSON codec.
pub struct JsonWriter<W> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(writer: W) -> Self {
        JsonWriter {
            writer,
            buf: BytesMut::with_capacity(1024),
        }
    }
}

impl<W: Write + Send> CodecWrite for JsonWriter<W> {
    fn write(&mut self, header: &Header, body: &[u8]) -> io::Result<()> {
        let head = serde_json::to_vec(header)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        self.buf.extend_from_slice(&head);
        self.buf.extend_from_slice(b"\n");
        self.buf.extend_from_slice(body);
        if body.last() != Some(&b'\n') {
            self.buf.extend_from_slice(b"\n");
        }
        let ret = self.writer.write_all(&self.buf).and_then(|_| self.writer.flush());
        self.buf.clear();
        ret
    }
}
