//! A load-balancing client over many servers: unicast through a selection
//! policy, broadcast with first-success reply and first-error cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use co_managed::Manager;
use may::sync::{mpsc, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::Client;
use crate::discovery::{Discovery, SelectMode};
use crate::errors::Error;
use crate::Options;

struct XInner {
    discovery: Arc<dyn Discovery>,
    mode: SelectMode,
    opt: Options,
    // dial-or-evict is one critical section
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

/// A client over a set of servers produced by a [`Discovery`].
///
/// Sub-clients are cached per `"protocol@host:port"` address and replaced
/// when they stop being available. Cloning shares the cache.
#[derive(Clone)]
pub struct XClient {
    inner: Arc<XInner>,
}

impl XClient {
    /// Build a multi-server client from a discovery, a selection mode and an
    /// option template used for every dialed connection.
    pub fn new(discovery: Arc<dyn Discovery>, mode: SelectMode, opt: Options) -> XClient {
        XClient {
            inner: Arc::new(XInner {
                discovery,
                mode,
                opt,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn dial(&self, rpc_addr: &str) -> Result<Arc<Client>, Error> {
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let _ = client.close();
            clients.remove(rpc_addr);
        }
        let client = Arc::new(Client::xdial(rpc_addr, &self.inner.opt)?);
        clients.insert(rpc_addr.to_owned(), client.clone());
        Ok(client)
    }

    fn call_addr<R>(
        &self,
        rpc_addr: &str,
        service_method: &str,
        body: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<R, Error>
    where
        R: DeserializeOwned,
    {
        let client = self.dial(rpc_addr)?;
        let call = client.go_raw::<R>(service_method, body)?;
        match timeout {
            None => call.recv(),
            Some(d) => call.recv_timeout(d),
        }
    }

    fn encode<A: Serialize + ?Sized>(&self, args: &A) -> Result<Vec<u8>, Error> {
        self.inner
            .opt
            .codec_type
            .encode(args)
            .map_err(Error::ClientSerialize)
    }

    /// Call one server picked by the discovery's selection mode.
    pub fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_inner(service_method, args, None)
    }

    /// Like [`call`](XClient::call) with a per-call deadline.
    pub fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_inner(service_method, args, Some(timeout))
    }

    fn call_inner<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.inner.discovery.get(self.inner.mode)?;
        let body = self.encode(args)?;
        self.call_addr(&rpc_addr, service_method, body, timeout)
    }

    /// Fan the call out to every known server.
    ///
    /// The first successful reply is the one returned; the first error is
    /// retained, cancels the remaining siblings and wins over any success.
    /// Each sibling decodes into its own fresh reply, so servers never race
    /// on shared memory.
    pub fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.broadcast_inner(service_method, args, None)
    }

    /// Like [`broadcast`](XClient::broadcast) with a deadline applied to
    /// every sibling call.
    pub fn broadcast_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.broadcast_inner(service_method, args, Some(timeout))
    }

    fn broadcast_inner<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.inner.discovery.get_all()?;
        let body = self.encode(args)?;

        let (tx, rx) = mpsc::channel::<Result<R, Error>>();
        let manager = Manager::new();
        for rpc_addr in servers {
            let tx = tx.clone();
            let xc = self.clone();
            let method = service_method.to_owned();
            let body = body.clone();
            manager.add(move |_| {
                let _ = tx.send(xc.call_addr(&rpc_addr, &method, body, timeout));
            });
        }
        drop(tx);

        let mut reply = None;
        while let Ok(result) = rx.recv() {
            match result {
                Ok(r) => {
                    if reply.is_none() {
                        reply = Some(r);
                    }
                }
                // first error wins; dropping the manager below cancels the
                // siblings still in flight
                Err(e) => return Err(e),
            }
        }
        reply.ok_or(Error::NoServers)
    }

    /// Close and drop every cached sub-client.
    pub fn close(&self) {
        let mut clients = self.inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        for (_, client) in clients.drain() {
            let _ = client.close();
        }
    }
}
