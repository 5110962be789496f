//! The server side: accept loops, the per-connection handshake, the request
//! loop and the per-request dispatch worker with its handle timeout.

use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use co_managed::Manager;
use log::{error, info};
use may::net::{TcpListener, TcpStream};
use may::sync::{mpsc, Mutex, RwLock};
use may::{coroutine, go};

use crate::codec::{CodecType, CodecWrite, Header};
use crate::errors::Error;
use crate::http;
use crate::service::{LookupError, Method, Service};
use crate::{read_options, write_options, MAGIC_NUMBER};

/// Default path answering `CONNECT` upgrades on an HTTP-served listener.
pub const DEFAULT_RPC_PATH: &str = "/_simplerpc_";

pub(crate) const CONNECTED: &str = "200 Connected to Gee RPC";

type SendHalf = Arc<Mutex<Box<dyn CodecWrite>>>;

/// A running background loop (server accept loop or registry listener).
///
/// Dropping the instance cancels the loop and everything it spawned.
pub struct ServerInstance {
    handle: Option<coroutine::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ServerInstance {
    pub(crate) fn new(handle: coroutine::JoinHandle<()>, local_addr: SocketAddr) -> Self {
        ServerInstance {
            handle: Some(handle),
            local_addr,
        }
    }

    /// The address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait until the loop stops on its own.
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}

/// An RPC server: a set of named services plus the machinery to serve them
/// over raw TCP or an HTTP `CONNECT` hijack.
///
/// Cloning is cheap and clones share the service map, so services may still
/// be registered after the accept loop has started.
#[derive(Clone)]
pub struct Server {
    services: Arc<RwLock<HashMap<String, Service>>>,
}

impl Default for Server {
    fn default() -> Server {
        Server::new()
    }
}

impl Server {
    /// Create a server with no services.
    pub fn new() -> Server {
        Server {
            services: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a service. Fails if one with the same name already exists.
    pub fn register(&self, service: Service) -> Result<(), Error> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::ServiceAlreadyDefined(service.name().to_owned()));
        }
        info!("rpc server: register service {}", service.name());
        services.insert(service.name().to_owned(), service);
        Ok(())
    }

    /// Bind the address and serve raw TCP connections until the returned
    /// instance is dropped. Accept errors terminate the loop; per-connection
    /// errors stay local to their worker.
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> io::Result<ServerInstance> {
        self.listen(addr, false)
    }

    /// Bind the address and serve connections arriving as HTTP `CONNECT`
    /// requests on [`DEFAULT_RPC_PATH`]. After the `200` reply the raw byte
    /// stream is handed to the normal per-connection path.
    pub fn start_http<L: ToSocketAddrs>(&self, addr: L) -> io::Result<ServerInstance> {
        self.listen(addr, true)
    }

    fn listen<L: ToSocketAddrs>(&self, addr: L, http: bool) -> io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let server = self.clone();
        let name = if http { "RpcHttpServer" } else { "RpcServer" };
        let handle = go!(coroutine::Builder::new().name(name.to_owned()), move || {
            let manager = Manager::new();
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        error!("rpc server: accept error: {}", e);
                        return;
                    }
                };
                stream.set_nodelay(true).ok();
                let server = server.clone();
                manager.add(move |_| {
                    if http {
                        server.serve_http_conn(stream);
                    } else {
                        server.serve_conn(stream);
                    }
                });
            }
        })?;
        Ok(ServerInstance::new(handle, local_addr))
    }

    fn serve_conn(&self, stream: TcpStream) {
        let reader = match stream.try_clone() {
            Ok(s) => BufReader::with_capacity(1024, s),
            Err(e) => {
                error!("rpc server: clone stream error: {}", e);
                return;
            }
        };
        self.serve_stream(reader, stream);
    }

    fn serve_http_conn(&self, stream: TcpStream) {
        let mut reader = match stream.try_clone() {
            Ok(s) => BufReader::with_capacity(1024, s),
            Err(e) => {
                error!("rpc server: clone stream error: {}", e);
                return;
            }
        };
        let mut writer = stream;
        let req = match http::read_request(&mut reader) {
            Ok(r) => r,
            Err(e) => {
                error!("rpc server: bad http request: {}", e);
                return;
            }
        };
        if req.method != "CONNECT" {
            let _ = http::write_response(
                &mut writer,
                "405 Method Not Allowed",
                &[("Content-Type", "text/plain; charset=utf-8")],
                "405 must CONNECT\n",
            );
            return;
        }
        if req.path != DEFAULT_RPC_PATH {
            let _ = http::write_response(
                &mut writer,
                "404 Not Found",
                &[("Content-Type", "text/plain; charset=utf-8")],
                "404 page not found\n",
            );
            return;
        }
        if let Err(e) = write!(writer, "HTTP/1.0 {CONNECTED}\n\n").and_then(|_| writer.flush()) {
            error!("rpc server: hijack error: {}", e);
            return;
        }
        self.serve_stream(reader, writer);
    }

    /// Handshake then request loop. The option preamble is the only
    /// non-codec framing on the wire; the echo must be observed by the
    /// client before it starts sending binary frames, which is what keeps a
    /// codec frame from ever arriving glued to the option bytes.
    fn serve_stream(&self, mut reader: BufReader<TcpStream>, mut writer: TcpStream) {
        let opt = match read_options(&mut reader) {
            Ok(o) => o,
            Err(e) => {
                error!("rpc server: options error: {}", e);
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            error!("rpc server: invalid magic number {:#x}", opt.magic_number);
            return;
        }
        if let Err(e) = write_options(&mut writer, &opt) {
            error!("rpc server: option echo error: {}", e);
            return;
        }

        let wire = opt.codec_type;
        let mut codec = wire.reader(reader);
        let sending: SendHalf = Arc::new(Mutex::new(wire.writer(writer)));
        let mut header = Header::default();
        loop {
            if let Err(e) = codec.read_header(&mut header) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    info!("rpc server: connection closed");
                } else {
                    error!("rpc server: read header error: {}", e);
                }
                break;
            }
            let lookup = self.lookup(&header.service_method);
            // the body is drained even when the lookup failed, so one bad
            // target does not desync the stream
            let body = match codec.read_body() {
                Ok(b) => b,
                Err(e) => {
                    error!("rpc server: read body error: {}", e);
                    let mut h = header.clone();
                    h.error = format!("rpc server: read body error: {e}");
                    send_response(&sending, &h, &wire.placeholder());
                    break;
                }
            };
            match lookup {
                Err(e) => {
                    let mut h = header.clone();
                    h.error = e.to_string();
                    send_response(&sending, &h, &wire.placeholder());
                }
                Ok(method) => {
                    let sending = sending.clone();
                    let h = header.clone();
                    let timeout = opt.handle_timeout;
                    go!(move || handle_request(method, wire, h, body, sending, timeout));
                }
            }
        }
        // in-flight dispatches each hold the write half; the stream closes
        // once the last of them has finished writing
    }

    fn lookup(&self, service_method: &str) -> Result<Arc<Method>, LookupError> {
        let (service, method) = service_method
            .rsplit_once('.')
            .ok_or_else(|| LookupError::IllFormed(service_method.to_owned()))?;
        let services = self.services.read().unwrap();
        let svc = services
            .get(service)
            .ok_or_else(|| LookupError::ServiceNotFound(service.to_owned()))?;
        svc.lookup(method)
    }
}

/// Invoke the method on its own worker, racing the handle timeout. On expiry
/// the timeout response goes out with the original seq and the late result,
/// if it ever lands, is dropped with the channel; the connection stays up.
fn handle_request(
    method: Arc<Method>,
    wire: CodecType,
    mut header: Header,
    body: Vec<u8>,
    sending: SendHalf,
    timeout: Duration,
) {
    let (tx, rx) = mpsc::channel();
    go!(move || {
        let _ = tx.send(method.call(wire, &body));
    });
    let result = if timeout.is_zero() {
        rx.recv().ok()
    } else {
        rx.recv_timeout(timeout).ok()
    };
    match result {
        Some(Ok(reply)) => {
            header.error.clear();
            send_response(&sending, &header, &reply);
        }
        Some(Err(e)) => {
            header.error = e.to_string();
            send_response(&sending, &header, &wire.placeholder());
        }
        None => {
            header.error = if timeout.is_zero() {
                "rpc server: internal error".to_owned()
            } else {
                format!("rpc server: request handle timeout expect within {timeout:?}")
            };
            send_response(&sending, &header, &wire.placeholder());
        }
    }
}

fn send_response(sending: &Mutex<Box<dyn CodecWrite>>, header: &Header, body: &[u8]) {
    let mut codec = sending.lock().unwrap();
    if let Err(e) = codec.write(header, body) {
        // the connection is already compromised, nothing to unwind
        error!("rpc server: write response error: {}", e);
    }
}
