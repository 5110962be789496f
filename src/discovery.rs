//! Server-set discovery: a static list with selection policies, and a
//! registry-backed variant that refreshes the list over HTTP with a TTL.

use std::time::{Duration, Instant};

use log::{error, info};
use may::sync::{Mutex, RwLock};
use rand::Rng;

use crate::errors::Error;
use crate::http;
use crate::registry::SERVERS_HEADER;

/// How [`Discovery::get`] picks one server from the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random choice.
    Random,
    /// Cycle through the list.
    RoundRobin,
}

/// A provider of the currently usable server addresses.
pub trait Discovery: Send + Sync {
    /// Re-pull the server set from wherever it originates, if anywhere.
    fn refresh(&self) -> Result<(), Error>;
    /// Replace the server set by hand.
    fn update(&self, servers: Vec<String>) -> Result<(), Error>;
    /// Pick one address according to the selection mode.
    fn get(&self, mode: SelectMode) -> Result<String, Error>;
    /// A snapshot of every known address.
    fn get_all(&self) -> Result<Vec<String>, Error>;
}

struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// A hand-maintained server list.
pub struct MultiServers {
    inner: RwLock<ServerList>,
}

impl MultiServers {
    /// Create a discovery over a fixed list. The round-robin cursor starts at
    /// a random point in `[0, 2^31 - 1)` so that restarted clients do not all
    /// hammer the same first server.
    pub fn new(servers: Vec<String>) -> MultiServers {
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        MultiServers {
            inner: RwLock::new(ServerList { servers, index }),
        }
    }
}

impl Discovery for MultiServers {
    fn refresh(&self) -> Result<(), Error> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        self.inner.write().unwrap().servers = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String, Error> {
        let mut inner = self.inner.write().unwrap();
        let n = inner.servers.len();
        if n == 0 {
            return Err(Error::NoServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let s = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(s)
            }
        }
    }

    fn get_all(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.read().unwrap().servers.clone())
    }
}

const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A discovery that pulls its list from a registry over HTTP, caching it for
/// a fixed interval.
pub struct RegistryDiscovery {
    servers: MultiServers,
    registry: String,
    timeout: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// Create a discovery against a registry URL such as
    /// `http://127.0.0.1:9999/_simplerpc_/registry`. A zero `timeout` falls
    /// back to ten seconds.
    pub fn new(registry: &str, timeout: Duration) -> RegistryDiscovery {
        let timeout = if timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            timeout
        };
        RegistryDiscovery {
            servers: MultiServers::new(Vec::new()),
            registry: registry.to_owned(),
            timeout,
            last_update: Mutex::new(None),
        }
    }
}

impl Discovery for RegistryDiscovery {
    fn refresh(&self) -> Result<(), Error> {
        let mut last_update = self.last_update.lock().unwrap();
        if let Some(t) = *last_update {
            if t.elapsed() < self.timeout {
                return Ok(());
            }
        }
        info!("rpc registry: refresh servers from registry {}", self.registry);
        let resp = http::request("GET", &self.registry, None).map_err(|e| {
            error!("rpc registry: refresh err: {}", e);
            e
        })?;
        if !resp.is_success() {
            return Err(Error::Http(resp.status));
        }
        let servers: Vec<String> = resp
            .header(SERVERS_HEADER)
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_owned())
            .collect();
        self.servers.update(servers)?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<(), Error> {
        let mut last_update = self.last_update.lock().unwrap();
        self.servers.update(servers)?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String, Error> {
        self.refresh()?;
        self.servers.get(mode)
    }

    fn get_all(&self) -> Result<Vec<String>, Error> {
        self.refresh()?;
        self.servers.get_all()
    }
}
