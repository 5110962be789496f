//! The heartbeat registry: an in-memory server set with a TTL, spoken to
//! over a two-verb HTTP interface, plus the server-side heartbeat loop.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use co_managed::Manager;
use log::{error, info};
use may::net::{TcpListener, TcpStream};
use may::sync::Mutex;
use may::{coroutine, go};

use crate::errors::Error;
use crate::http;
use crate::server::ServerInstance;

/// Default path the registry answers on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_simplerpc_/registry";

/// Default entry lifetime, also the anchor for the derived heartbeat period.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// The header carrying server addresses in both directions.
pub(crate) const SERVERS_HEADER: &str = "X-Simplerpc-Servers";

struct ServerItem {
    addr: String,
    start: Instant,
}

/// An in-memory registry of alive servers.
///
/// `GET` returns the alive set, sorted and comma-joined, in
/// `X-Simplerpc-Servers`; `POST` upserts the single address found in the same
/// header and refreshes its timestamp. Entries silent for longer than the TTL
/// are swept on read; a zero TTL disables expiry.
#[derive(Clone)]
pub struct Registry {
    ttl: Duration,
    servers: Arc<Mutex<HashMap<String, ServerItem>>>,
}

impl Registry {
    /// Create a registry with the given entry TTL (zero: entries never
    /// expire).
    pub fn new(ttl: Duration) -> Registry {
        Registry {
            ttl,
            servers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(addr) {
            Some(item) => item.start = Instant::now(),
            None => {
                servers.insert(
                    addr.to_owned(),
                    ServerItem {
                        addr: addr.to_owned(),
                        start: Instant::now(),
                    },
                );
            }
        }
    }

    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let ttl = self.ttl;
        let mut alive = Vec::with_capacity(servers.len());
        servers.retain(|_, item| {
            if ttl.is_zero() || item.start.elapsed() < ttl {
                alive.push(item.addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// Bind the address and answer registry requests on
    /// [`DEFAULT_REGISTRY_PATH`] until the instance is dropped.
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let registry = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("RpcRegistry".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(s) => s,
                        Err(e) => {
                            error!("rpc registry: accept error: {}", e);
                            return;
                        }
                    };
                    let registry = registry.clone();
                    manager.add(move |_| registry.serve_conn(stream));
                }
            }
        )?;
        Ok(ServerInstance::new(handle, local_addr))
    }

    fn serve_conn(&self, stream: TcpStream) {
        let mut reader = match stream.try_clone() {
            Ok(s) => BufReader::with_capacity(1024, s),
            Err(e) => {
                error!("rpc registry: clone stream error: {}", e);
                return;
            }
        };
        let mut writer = stream;
        let req = match http::read_request(&mut reader) {
            Ok(r) => r,
            Err(e) => {
                error!("rpc registry: bad request: {}", e);
                return;
            }
        };
        let result = if req.path != DEFAULT_REGISTRY_PATH {
            http::write_response(&mut writer, "404 Not Found", &[], "")
        } else {
            match req.method.as_str() {
                "GET" => {
                    let alive = self.alive_servers().join(",");
                    http::write_response(&mut writer, "200 OK", &[(SERVERS_HEADER, &alive)], "")
                }
                "POST" => match req.headers.get(&SERVERS_HEADER.to_ascii_lowercase()) {
                    Some(addr) if !addr.is_empty() => {
                        info!("rpc registry: heartbeat from {}", addr);
                        self.put_server(addr);
                        http::write_response(&mut writer, "200 OK", &[], "")
                    }
                    _ => http::write_response(&mut writer, "500 Internal Server Error", &[], ""),
                },
                _ => http::write_response(&mut writer, "405 Method Not Allowed", &[], ""),
            }
        };
        if let Err(e) = result {
            error!("rpc registry: write response error: {}", e);
        }
    }
}

/// A running heartbeat loop. Dropping it stops the heartbeats; the registry
/// entry then ages out on its own.
pub struct Heartbeat(Option<coroutine::JoinHandle<()>>);

impl Heartbeat {
    /// Stop sending heartbeats.
    pub fn stop(self) {}
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(h) = self.0.take() {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}

/// Advertise `addr` (a `"protocol@host:port"` string) to the registry, then
/// keep re-posting on a timer until a post fails.
///
/// The first post runs synchronously so the caller observes an immediate
/// failure. A zero or over-large `period` is replaced by the registry's
/// default TTL minus one minute, leaving each beat a comfortable margin
/// before the entry would expire.
pub fn heartbeat(registry: &str, addr: &str, period: Duration) -> Result<Heartbeat, Error> {
    let period = if period.is_zero() || period > DEFAULT_TTL {
        DEFAULT_TTL - Duration::from_secs(60)
    } else {
        period
    };
    send_heartbeat(registry, addr)?;
    let registry = registry.to_owned();
    let addr = addr.to_owned();
    let handle = go!(
        coroutine::Builder::new().name("RpcHeartbeat".to_owned()),
        move || loop {
            coroutine::sleep(period);
            if let Err(e) = send_heartbeat(&registry, &addr) {
                error!("rpc server: heart beat err: {}", e);
                break;
            }
        }
    )?;
    Ok(Heartbeat(Some(handle)))
}

fn send_heartbeat(registry: &str, addr: &str) -> Result<(), Error> {
    info!("{} send heart beat to registry {}", addr, registry);
    let resp = http::request("POST", registry, Some((SERVERS_HEADER, addr)))?;
    if !resp.is_success() {
        return Err(Error::Http(resp.status));
    }
    Ok(())
}
