//! The pipelined client: one shared connection, monotonically numbered
//! in-flight calls, a background receiver demultiplexing responses by
//! sequence number.

use std::collections::HashMap;
use std::io::{self, BufReader, Write};
use std::marker::PhantomData;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use may::net::TcpStream;
use may::sync::mpsc::{self, Receiver, Sender};
use may::sync::Mutex;
use may::{coroutine, go};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{CodecRead, CodecType, CodecWrite, Header};
use crate::errors::Error;
use crate::http;
use crate::server::{CONNECTED, DEFAULT_RPC_PATH};
use crate::{read_options, write_options, Options, MAGIC_NUMBER};

type CallResult = Result<Vec<u8>, Error>;

// the header is reused between sends, so it lives under the send mutex
struct SendHalf {
    codec: Box<dyn CodecWrite>,
    header: Header,
}

struct State {
    seq: u64,
    pending: HashMap<u64, Sender<CallResult>>,
    // the user asked for the connection to go away
    closing: bool,
    // the receiver failed and tore the connection down
    shutdown: bool,
}

struct Inner {
    wire: CodecType,
    stream: TcpStream,
    sending: Mutex<SendHalf>,
    state: Mutex<State>,
}

impl Inner {
    fn remove_call(&self, seq: u64) -> Option<Sender<CallResult>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.remove(&seq)
    }
}

/// One outstanding request, waiting to be resolved into an `R`.
///
/// Produced by [`Client::go`]; resolved by [`recv`](Call::recv) or
/// [`recv_timeout`](Call::recv_timeout). Dropping an unresolved call cancels
/// it: the pending entry is removed and a late response is silently dropped
/// by the receiver.
pub struct Call<R> {
    seq: u64,
    rx: Receiver<CallResult>,
    inner: Arc<Inner>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    fn finish(&self, result: CallResult) -> Result<R, Error> {
        let body = result?;
        self.inner
            .wire
            .decode(&body)
            .map_err(|e| Error::ClientDeserialize(format!("reading body: {e}")))
    }

    /// Block until the call resolves.
    pub fn recv(self) -> Result<R, Error> {
        match self.rx.recv() {
            Ok(result) => self.finish(result),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Block with a deadline. On expiry the call is removed from the pending
    /// table and a local timeout error is synthesized; the connection itself
    /// is left alone.
    pub fn recv_timeout(self, timeout: Duration) -> Result<R, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => self.finish(result),
            Err(_) => {
                // entry still pending means a genuine timeout; entry gone
                // means the call resolved in the race window or the client
                // tore down under us
                if self.inner.remove_call(self.seq).is_some() {
                    Err(Error::CallTimeout(timeout))
                } else if let Ok(result) = self.rx.try_recv() {
                    self.finish(result)
                } else {
                    Err(Error::Shutdown)
                }
            }
        }
    }
}

impl<R> Call<R> {
    /// The sequence number this call went out under.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        // cancellation cleanup; a no-op when the call already resolved
        self.inner.remove_call(self.seq);
    }
}

/// A connection to one RPC server, usable concurrently from many coroutines.
///
/// Calls are pipelined: each gets a fresh sequence number under the send
/// mutex and may complete out of order; the background receiver routes every
/// response to its waiting caller.
pub struct Client {
    inner: Arc<Inner>,
    receiver: Option<coroutine::JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dial a raw TCP address and perform the option handshake, bounded by
    /// the option's `connect_timeout` (zero means unbounded).
    pub fn dial(addr: &str, opt: &Options) -> Result<Client, Error> {
        Client::dial_with(Client::connect, addr, opt)
    }

    /// Dial through an HTTP `CONNECT` upgrade on [`DEFAULT_RPC_PATH`], then
    /// perform the normal handshake over the hijacked stream.
    pub fn dial_http(addr: &str, opt: &Options) -> Result<Client, Error> {
        Client::dial_with(Client::connect_http, addr, opt)
    }

    /// Dial a `"protocol@host:port"` address: `http@...` upgrades via
    /// CONNECT, anything else is raw TCP.
    pub fn xdial(rpc_addr: &str, opt: &Options) -> Result<Client, Error> {
        match rpc_addr.split_once('@') {
            Some(("http", addr)) => Client::dial_http(addr, opt),
            Some((_proto, addr)) => Client::dial(addr, opt),
            None => Err(Error::InvalidAddress(rpc_addr.to_owned())),
        }
    }

    fn dial_with(
        connect: fn(&str, Options) -> Result<Client, Error>,
        addr: &str,
        opt: &Options,
    ) -> Result<Client, Error> {
        let mut opt = opt.clone();
        opt.magic_number = MAGIC_NUMBER;
        let timeout = opt.connect_timeout;
        let addr = addr.to_owned();
        let (tx, rx) = mpsc::channel();
        go!(move || {
            let _ = tx.send(connect(&addr, opt));
        });
        if timeout.is_zero() {
            rx.recv().unwrap_or(Err(Error::Shutdown))
        } else {
            match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectTimeout(timeout)),
            }
        }
    }

    fn connect(addr: &str, opt: Options) -> Result<Client, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::with_capacity(1024, stream.try_clone()?);
        Client::handshake(stream, reader, opt)
    }

    fn connect_http(addr: &str, opt: Options) -> Result<Client, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::with_capacity(1024, stream.try_clone()?);
        write!(writer, "CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n")?;
        writer.flush()?;
        let resp = http::read_response(&mut reader)?;
        if resp.status != CONNECTED {
            return Err(Error::Http(resp.status));
        }
        Client::handshake(stream, reader, opt)
    }

    /// Send the options, await the server's echo, then start the receiver.
    /// Waiting for the echo before the first frame is what keeps our header
    /// from arriving glued to the option bytes in a single server read.
    fn handshake(
        stream: TcpStream,
        mut reader: BufReader<TcpStream>,
        opt: Options,
    ) -> Result<Client, Error> {
        let mut writer = stream.try_clone()?;
        write_options(&mut writer, &opt)?;
        let echo = read_options(&mut reader).map_err(|e| Error::Handshake(e.to_string()))?;
        if echo.magic_number != MAGIC_NUMBER {
            return Err(Error::Handshake(format!(
                "invalid magic number {:#x} in echo",
                echo.magic_number
            )));
        }

        let wire = opt.codec_type;
        let inner = Arc::new(Inner {
            wire,
            stream,
            sending: Mutex::new(SendHalf {
                codec: wire.writer(writer),
                header: Header::default(),
            }),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let codec = wire.reader(reader);
        let inner2 = inner.clone();
        let receiver = go!(
            coroutine::Builder::new().name("RpcClientReceiver".to_owned()),
            move || receive(inner2, codec)
        )?;
        Ok(Client {
            inner,
            receiver: Some(receiver),
        })
    }

    /// Post a call asynchronously, returning a [`Call`] to wait on.
    pub fn go<A, R>(&self, service_method: &str, args: &A) -> Result<Call<R>, Error>
    where
        A: Serialize + ?Sized,
    {
        let body = self
            .inner
            .wire
            .encode(args)
            .map_err(Error::ClientSerialize)?;
        self.go_raw(service_method, body)
    }

    pub(crate) fn go_raw<R>(&self, service_method: &str, body: Vec<u8>) -> Result<Call<R>, Error> {
        let (tx, rx) = mpsc::channel();
        let mut sending = self.inner.sending.lock().unwrap_or_else(|e| e.into_inner());
        let seq = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(seq, tx);
            seq
        };
        let SendHalf { codec, header } = &mut *sending;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = seq;
        header.error.clear();
        if let Err(e) = codec.write(header, &body) {
            self.inner.remove_call(seq);
            return Err(e.into());
        }
        Ok(Call {
            seq,
            rx,
            inner: self.inner.clone(),
            _marker: PhantomData,
        })
    }

    /// Call and block until the reply arrives or the connection dies.
    pub fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args)?.recv()
    }

    /// Call with a per-call deadline. A timed out call is cancelled locally;
    /// its late response, if any, is dropped by the receiver.
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
        self.go(service_method, args)?.recv_timeout(timeout)
    }

    /// Whether the client can still issue calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.closing && !state.shutdown
    }

    /// Close the connection. A second close returns the shutdown sentinel.
    pub fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.close();
        if let Some(h) = self.receiver.take() {
            unsafe { h.coroutine().cancel() };
            h.join().ok();
        }
    }
}

fn receive(inner: Arc<Inner>, mut codec: Box<dyn CodecRead>) {
    let err = loop {
        let mut header = Header::default();
        if let Err(e) = codec.read_header(&mut header) {
            break e;
        }
        let call = inner.remove_call(header.seq);
        // the body record is read even with no matching call, both to drain
        // the stream and because error responses still carry a placeholder
        match codec.read_body() {
            Ok(body) => match call {
                None => {}
                Some(tx) if !header.error.is_empty() => {
                    let _ = tx.send(Err(Error::Remote(std::mem::take(&mut header.error))));
                }
                Some(tx) => {
                    let _ = tx.send(Ok(body));
                }
            },
            Err(e) => {
                if let Some(tx) = call {
                    let _ = tx.send(Err(Error::Disconnected(e.to_string())));
                }
                break e;
            }
        }
    };
    if err.kind() == io::ErrorKind::UnexpectedEof {
        info!("rpc client: connection closed");
    } else {
        error!("rpc client: read error: {}", err);
    }
    terminate_calls(&inner, &err);
}

/// Mark the client shut down and resolve every pending call with the
/// propagated reason. Takes the send mutex first so no sender is mid-write
/// while the table drains.
fn terminate_calls(inner: &Inner, err: &io::Error) {
    let _sending = inner.sending.lock().unwrap_or_else(|e| e.into_inner());
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    state.shutdown = true;
    for (_, tx) in state.pending.drain() {
        let _ = tx.send(Err(Error::Disconnected(err.to_string())));
    }
}
