//! The pluggable framing and serialization layer.
//!
//! A connection carries a stream of frames, each a header record followed by a
//! body record. How a record is laid out on the wire is the codec's business:
//! the gob codec writes length-prefixed bincode records, the json codec writes
//! one JSON value per line. The rest of the crate only relies on records being
//! separable ("read header", "read body") and on a header+body write being a
//! single flushed unit.
//!
//! Bodies cross this layer as raw record bytes; the typed view lives with
//! whoever knows the type (the method handler on the server, the waiting
//! caller on the client) through [`CodecType::encode`] and
//! [`CodecType::decode`].

use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod gob;
mod json;

use gob::{GobReader, GobWriter};
use json::{JsonReader, JsonWriter};

/// The per-frame header preceding every body record.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Call target in `"Service.Method"` form.
    pub service_method: String,
    /// Client-assigned sequence number, the sole correlation key.
    pub seq: u64,
    /// Empty on success; a server-side failure message otherwise, in which
    /// case the body is an opaque placeholder.
    pub error: String,
}

/// Identifies a codec during the handshake.
///
/// The string tags are wire constants; both peers must resolve a tag to the
/// same record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    /// The default binary codec: length-prefixed bincode records.
    #[serde(rename = "application/gob")]
    Gob,
    /// Newline-delimited JSON records.
    #[serde(rename = "application/json")]
    Json,
}

/// The read half of a codec, owned by a connection's single reader.
pub trait CodecRead: Send {
    /// Read the next header record.
    ///
    /// A clean end of stream surfaces as `ErrorKind::UnexpectedEof`.
    fn read_header(&mut self, header: &mut Header) -> io::Result<()>;

    /// Read the next body record and return its raw bytes.
    fn read_body(&mut self) -> io::Result<Vec<u8>>;
}

/// The write half of a codec, shared behind the connection's send mutex.
pub trait CodecWrite: Send {
    /// Write one frame: header record then body record, flushed before
    /// returning. The caller must hold the send mutex, which makes the pair
    /// atomic against other writers.
    fn write(&mut self, header: &Header, body: &[u8]) -> io::Result<()>;
}

impl CodecType {
    /// Construct the read half over a buffered stream.
    pub fn reader<R: BufRead + Send + 'static>(self, r: R) -> Box<dyn CodecRead> {
        match self {
            CodecType::Gob => Box::new(GobReader::new(r)),
            CodecType::Json => Box::new(JsonReader::new(r)),
        }
    }

    /// Construct the write half over a stream.
    pub fn writer<W: Write + Send + 'static>(self, w: W) -> Box<dyn CodecWrite> {
        match self {
            CodecType::Gob => Box::new(GobWriter::new(w)),
            CodecType::Json => Box::new(JsonWriter::new(w)),
        }
    }

    /// Serialize a value into the bytes of one body record.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, String> {
        match self {
            CodecType::Gob => bincode::serialize(value).map_err(|e| e.to_string()),
            CodecType::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
    }

    /// Deserialize a value from the bytes of one body record.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, String> {
        match self {
            CodecType::Gob => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            CodecType::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }

    /// The encoded unit value, used as the body of error responses.
    pub(crate) fn placeholder(self) -> Vec<u8> {
        self.encode(&()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_type_wire_tags() {
        assert_eq!(
            serde_json::to_string(&CodecType::Gob).unwrap(),
            "\"application/gob\""
        );
        assert_eq!(
            serde_json::to_string(&CodecType::Json).unwrap(),
            "\"application/json\""
        );
        let t: CodecType = serde_json::from_str("\"application/json\"").unwrap();
        assert_eq!(t, CodecType::Json);
        assert!(serde_json::from_str::<CodecType>("\"application/xml\"").is_err());
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame_roundtrip(ty: CodecType) {
        let sink = SharedBuf::default();
        {
            let mut w = ty.writer(sink.clone());
            let h = Header {
                service_method: "Arith.Sum".to_owned(),
                seq: 7,
                error: String::new(),
            };
            let body = ty.encode(&(1i32, 2i32)).unwrap();
            w.write(&h, &body).unwrap();
            let h2 = Header {
                service_method: "Arith.Sum".to_owned(),
                seq: 8,
                error: "boom".to_owned(),
            };
            w.write(&h2, &ty.placeholder()).unwrap();
        }

        let buf = sink.0.lock().unwrap().clone();
        let mut r = ty.reader(io::Cursor::new(buf));
        let mut h = Header::default();
        r.read_header(&mut h).unwrap();
        assert_eq!(h.seq, 7);
        assert_eq!(h.service_method, "Arith.Sum");
        assert!(h.error.is_empty());
        let body = r.read_body().unwrap();
        let args: (i32, i32) = ty.decode(&body).unwrap();
        assert_eq!(args, (1, 2));

        r.read_header(&mut h).unwrap();
        assert_eq!(h.seq, 8);
        assert_eq!(h.error, "boom");
        r.read_body().unwrap();

        // stream exhausted
        let err = r.read_header(&mut h).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn gob_frames() {
        frame_roundtrip(CodecType::Gob);
    }

    #[test]
    fn json_frames() {
        frame_roundtrip(CodecType::Json);
    }
}
