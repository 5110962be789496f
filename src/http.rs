//! Just enough HTTP/1.0 to support the CONNECT hijack and the registry:
//! request/response heads over a buffered stream and a one-shot client.
//! Anything beyond a head and a tiny body is out of scope here.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};

use may::net::TcpStream;

use crate::errors::Error;

/// A parsed request head. Header names are lowercased.
pub(crate) struct Request {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// A parsed response head. `status` is everything after the protocol version,
/// e.g. `"200 Connected to Gee RPC"`.
pub(crate) struct Response {
    pub status: String,
    pub headers: HashMap<String, String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.starts_with('2')
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

fn read_line<R: BufRead>(r: &mut R) -> io::Result<String> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_owned())
}

fn read_headers<R: BufRead>(r: &mut R) -> io::Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        let line = read_line(r)?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("bad header line: {line}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }
}

pub(crate) fn read_request<R: BufRead>(r: &mut R) -> io::Result<Request> {
    let line = read_line(r)?;
    let mut parts = line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m.to_owned(), p.to_owned()),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("bad request line: {line}"),
            ))
        }
    };
    let headers = read_headers(r)?;
    Ok(Request { method, path, headers })
}

pub(crate) fn read_response<R: BufRead>(r: &mut R) -> io::Result<Response> {
    let line = read_line(r)?;
    let status = match line.split_once(' ') {
        Some((_proto, rest)) => rest.to_owned(),
        None => {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("bad status line: {line}"),
            ))
        }
    };
    let headers = read_headers(r)?;
    Ok(Response { status, headers })
}

/// Write a response head plus optional body and close out the exchange.
pub(crate) fn write_response<W: Write>(
    w: &mut W,
    status: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> io::Result<()> {
    write!(w, "HTTP/1.0 {status}\r\n")?;
    for (name, value) in headers {
        write!(w, "{name}: {value}\r\n")?;
    }
    write!(w, "\r\n{body}")?;
    w.flush()
}

/// Split `http://host:port/path` into `(host:port, /path)`.
fn split_url(url: &str) -> Result<(&str, &str), Error> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| Error::InvalidAddress(url.to_owned()))?;
    match rest.find('/') {
        Some(i) => Ok((&rest[..i], &rest[i..])),
        None => Ok((rest, "/")),
    }
}

/// Issue a bodyless HTTP/1.0 request and read the response head.
pub(crate) fn request(
    method: &str,
    url: &str,
    header: Option<(&str, &str)>,
) -> Result<Response, Error> {
    let (host, path) = split_url(url)?;
    let stream = TcpStream::connect(host)?;
    let mut w = stream.try_clone()?;
    write!(w, "{method} {path} HTTP/1.0\r\nHost: {host}\r\n")?;
    if let Some((name, value)) = header {
        write!(w, "{name}: {value}\r\n")?;
    }
    write!(w, "\r\n")?;
    w.flush()?;
    let mut r = BufReader::new(stream);
    Ok(read_response(&mut r)?)
}
