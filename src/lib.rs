//! simplerpc is a small RPC framework for rust based on coroutines, built
//! around a length-prefixed request/response protocol with pluggable codecs.
//!
//! A server registers named services whose methods take one decoded argument
//! and fill one reply slot. A client multiplexes any number of concurrent
//! calls over a single connection, correlating responses by sequence number.
//! On top of that sit a load-balancing multi-server client with broadcast
//! support and a heartbeat registry for discovery.
//!
//! Every connection starts with a plaintext option exchange: the client sends
//! its [`Options`], the server validates the magic number and echoes them
//! back, and only then do codec frames flow. Each frame is a [`codec::Header`]
//! carrying `"Service.Method"`, a sequence number and an error slot, followed
//! by a codec-encoded body.
//!
//! Example usage:
//!
//! ```no_run
//! use simplerpc::{Client, Options, Server, Service};
//!
//! let server = Server::new();
//! server
//!     .register(Service::new("Arith").method(
//!         "Sum",
//!         |args: (i32, i32), reply: &mut i32| {
//!             *reply = args.0 + args.1;
//!             Ok(())
//!         },
//!     ))
//!     .unwrap();
//! let instance = server.start("127.0.0.1:4000").unwrap();
//!
//! let client = Client::dial("127.0.0.1:4000", &Options::default()).unwrap();
//! let sum: i32 = client.call("Arith.Sum", &(1, 2)).unwrap();
//! assert_eq!(sum, 3);
//! # drop(instance);
//! ```

#![deny(missing_docs)]

use std::io::{self, BufRead, ErrorKind, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The pluggable framing and serialization layer.
pub mod codec;

mod client;
mod discovery;
mod errors;
mod http;
mod registry;
mod server;
mod service;
mod xclient;

pub use client::{Call, Client};
pub use codec::{CodecType, Header};
pub use discovery::{Discovery, MultiServers, RegistryDiscovery, SelectMode};
pub use errors::{Error, WireError};
pub use registry::{heartbeat, Heartbeat, Registry, DEFAULT_REGISTRY_PATH, DEFAULT_TTL};
pub use server::{Server, ServerInstance, DEFAULT_RPC_PATH};
pub use service::{LookupError, Method, Service};
pub use xclient::XClient;

/// The sentinel both peers use to detect a misconfigured counterpart.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// The connection preamble, sent once by the client and echoed once by the
/// server before any codec frame.
///
/// Travels as one JSON value per direction, newline-delimited, so it stays
/// self-delimiting without involving the codec it negotiates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Must be [`MAGIC_NUMBER`]; anything else drops the connection.
    pub magic_number: u32,
    /// Which codec frames the rest of the connection.
    pub codec_type: CodecType,
    /// Bound on dial plus handshake; zero means unbounded.
    pub connect_timeout: Duration,
    /// Server-side bound on a single method execution; zero means unbounded.
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::Gob,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Default options with a different codec.
    pub fn with_codec(codec_type: CodecType) -> Options {
        Options {
            codec_type,
            ..Options::default()
        }
    }
}

pub(crate) fn write_options<W: Write>(w: &mut W, opt: &Options) -> io::Result<()> {
    let mut buf = serde_json::to_vec(opt)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    buf.push(b'\n');
    w.write_all(&buf)?;
    w.flush()
}

pub(crate) fn read_options<R: BufRead>(r: &mut R) -> io::Result<Options> {
    let mut line = Vec::with_capacity(256);
    if r.read_until(b'\n', &mut line)? == 0 {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    serde_json::from_slice(&line).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn options_roundtrip() {
        let opt = Options::with_codec(CodecType::Json);
        let mut buf = Vec::new();
        write_options(&mut buf, &opt).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));

        let mut r = io::Cursor::new(buf);
        let echo = read_options(&mut r).unwrap();
        assert_eq!(echo.magic_number, MAGIC_NUMBER);
        assert_eq!(echo.codec_type, CodecType::Json);
        assert_eq!(echo.connect_timeout, opt.connect_timeout);
    }

    #[test]
    fn options_stop_at_record_boundary() {
        let opt = Options::default();
        let mut buf = Vec::new();
        write_options(&mut buf, &opt).unwrap();
        buf.extend_from_slice(b"GARBAGE AFTER THE PREAMBLE");

        let mut r = io::Cursor::new(buf);
        read_options(&mut r).unwrap();
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"GARBAGE AFTER THE PREAMBLE");
    }
}
