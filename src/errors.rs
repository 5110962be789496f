use std::io;
use std::time::Duration;

use thiserror::Error;

/// All errors that can occur on the client side of a call.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error on the underlying connection.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// Error in serializing a client request.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize`.
    #[error("serializing a client request err: {0}")]
    ClientSerialize(String),
    /// Error in deserializing a server response.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize` or
    /// `serde::Deserialize`.
    #[error("deserializing a server response err: {0}")]
    ClientDeserialize(String),
    /// An error reported by the server in the response header.
    ///
    /// This covers handler errors, unknown services or methods and server-side
    /// handle timeouts; the message is exactly what the server sent.
    #[error("{0}")]
    Remote(String),
    /// The connection and protocol exchange could not complete in time.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
    /// The call did not complete within the caller supplied deadline.
    ///
    /// The pending call is removed; a late response is silently dropped.
    #[error("rpc client: call timeout: expect within {0:?}")]
    CallTimeout(Duration),
    /// The client was closed by the user or torn down after a receive failure.
    #[error("connection is shut down")]
    Shutdown,
    /// The connection failed while calls were still pending.
    ///
    /// Every pending call is resolved with the same propagated reason.
    #[error("connection lost: {0}")]
    Disconnected(String),
    /// A load-balanced address did not have the `protocol@host:port` shape.
    #[error("rpc client err: wrong format '{0}', expect protocol@addr")]
    InvalidAddress(String),
    /// An HTTP exchange (CONNECT upgrade or registry access) went wrong.
    #[error("unexpected HTTP response: {0}")]
    Http(String),
    /// The handshake echo from the server was missing or malformed.
    #[error("rpc client: handshake err: {0}")]
    Handshake(String),
    /// A service with the same name was already registered on this server.
    #[error("rpc: service already defined: {0}")]
    ServiceAlreadyDefined(String),
    /// The discovery has no servers to offer.
    #[error("rpc discovery: no available servers")]
    NoServers,
}

/// A server-side error carried back to the client in the response header.
#[derive(Debug, Error)]
pub enum WireError {
    /// Deserializing a client request failed on the server.
    #[error("rpc server: deserializing request err: {0}")]
    ServerDeserialize(String),
    /// Serializing the server response failed.
    #[error("rpc server: serializing response err: {0}")]
    ServerSerialize(String),
    /// The handler itself returned an error; the message is passed through as is.
    #[error("{0}")]
    Status(String),
}
