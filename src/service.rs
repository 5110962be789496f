//! Service registration: typed handlers erased behind per-method closures.
//!
//! A method is registered from a plain `Fn(arg, &mut reply) -> Result<(), String>`;
//! the registration wraps it into a closure that decodes the argument record,
//! allocates a fresh reply slot and encodes the result, so the dispatcher
//! never sees a typed value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::CodecType;
use crate::errors::WireError;

type Handler = Box<dyn Fn(CodecType, &[u8]) -> Result<Vec<u8>, WireError> + Send + Sync>;

/// Why a `"Service.Method"` lookup failed. The three cases produce distinct
/// error strings on the wire.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The target string has no `.` separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormed(String),
    /// No service registered under that name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
}

/// One registered method: the erased handler plus a call counter.
pub struct Method {
    name: String,
    calls: AtomicU64,
    handler: Handler,
}

impl Method {
    /// The method name as it appears after the `.` in a call target.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub(crate) fn call(&self, wire: CodecType, body: &[u8]) -> Result<Vec<u8>, WireError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(wire, body)
    }
}

/// A named collection of methods, registered on a [`Server`](crate::Server).
///
/// ```
/// use simplerpc::Service;
///
/// let svc = Service::new("Arith")
///     .method("Sum", |args: (i32, i32), reply: &mut i32| {
///         *reply = args.0 + args.1;
///         Ok(())
///     });
/// assert_eq!(svc.name(), "Arith");
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Start building a service. The name must be non-empty and dot-free
    /// since the rightmost `.` of a call target separates service from
    /// method; violating that is a programmer error and panics.
    pub fn new(name: &str) -> Service {
        assert!(
            !name.is_empty() && !name.contains('.'),
            "rpc server: {name:?} is not a valid service name"
        );
        Service {
            name: name.to_owned(),
            methods: HashMap::new(),
        }
    }

    /// Register one method.
    ///
    /// The handler receives the decoded argument and a freshly constructed
    /// reply slot (`R::default()`, so maps and vectors start out empty and
    /// handlers may append without any initialization of their own). A
    /// returned `Err` message travels back verbatim in the response header.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Service
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        F: Fn(A, &mut R) -> Result<(), String> + Send + Sync + 'static,
    {
        assert!(
            !name.is_empty() && !name.contains('.'),
            "rpc server: {name:?} is not a valid method name"
        );
        let handler: Handler = Box::new(move |wire, body| {
            let arg: A = wire
                .decode(body)
                .map_err(WireError::ServerDeserialize)?;
            let mut reply = R::default();
            f(arg, &mut reply).map_err(WireError::Status)?;
            wire.encode(&reply).map_err(WireError::ServerSerialize)
        });
        let method = Method {
            name: name.to_owned(),
            calls: AtomicU64::new(0),
            handler,
        };
        self.methods.insert(name.to_owned(), Arc::new(method));
        self
    }

    /// The service name as it appears before the `.` in a call target.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by bare name, e.g. to watch its call counter.
    pub fn get_method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    pub(crate) fn lookup(&self, method: &str) -> Result<Arc<Method>, LookupError> {
        self.methods
            .get(method)
            .cloned()
            .ok_or_else(|| LookupError::MethodNotFound(method.to_owned()))
    }
}
