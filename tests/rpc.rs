mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use may::go;
use may::sync::mpsc;
use simplerpc::{Client, CodecType, Error, Options};

use common::{init_logs, start_server};

#[test]
fn call_roundtrip() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();

    let sum: i32 = client.call("Arith.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);

    let echo: String = client.call("Arith.Echo", &"hello").unwrap();
    assert_eq!(echo, "hello");
}

#[test]
fn call_roundtrip_json_codec() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::with_codec(CodecType::Json)).unwrap();

    let sum: i32 = client.call("Arith.Sum", &(40, 2)).unwrap();
    assert_eq!(sum, 42);
}

#[test]
fn handler_error_reaches_caller() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();

    let err = client.call::<_, ()>("Arith.Fail", &()).unwrap_err();
    assert_eq!(err.to_string(), "arith says no");
}

#[test]
fn dispatch_errors_are_distinct_and_nonfatal() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();

    let ill = client.call::<_, i32>("NoDotHere", &(1, 2)).unwrap_err();
    assert!(ill.to_string().contains("ill-formed"), "{ill}");

    let no_service = client.call::<_, i32>("Nope.Sum", &(1, 2)).unwrap_err();
    assert!(no_service.to_string().contains("can't find service"), "{no_service}");

    let no_method = client.call::<_, i32>("Arith.Mul", &(1, 2)).unwrap_err();
    assert!(no_method.to_string().contains("can't find method"), "{no_method}");
    assert_ne!(no_service.to_string(), no_method.to_string());

    // the connection survived all three failures
    let sum: i32 = client.call("Arith.Sum", &(2, 2)).unwrap();
    assert_eq!(sum, 4);
}

#[test]
fn sequence_numbers_are_monotonic() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();

    let c1 = client.go::<_, i32>("Arith.Sum", &(1, 1)).unwrap();
    let c2 = client.go::<_, i32>("Arith.Sum", &(2, 2)).unwrap();
    assert!(c2.seq() > c1.seq());
    assert_eq!(c2.recv().unwrap(), 4);
    assert_eq!(c1.recv().unwrap(), 2);
}

#[test]
fn concurrent_calls_from_two_clients() {
    init_logs();
    let (_server, addr) = start_server();

    let (tx, rx) = mpsc::channel::<bool>();
    for _ in 0..2 {
        let client = Arc::new(Client::dial(&addr, &Options::default()).unwrap());
        for i in 0..100i32 {
            let client = client.clone();
            let tx = tx.clone();
            go!(move || {
                let ok = match client.call::<_, i32>("Arith.Sum", &(i, i)) {
                    Ok(r) => r == i + i,
                    Err(_) => false,
                };
                tx.send(ok).unwrap();
            });
        }
    }
    drop(tx);

    let mut done = 0;
    while let Ok(ok) = rx.recv() {
        assert!(ok);
        done += 1;
    }
    assert_eq!(done, 200);
}

#[test]
fn server_handle_timeout_keeps_connection() {
    init_logs();
    let (_server, addr) = start_server();
    let opt = Options {
        handle_timeout: Duration::from_millis(200),
        ..Options::default()
    };
    let client = Client::dial(&addr, &opt).unwrap();

    let start = Instant::now();
    let err = client.call::<_, u64>("Arith.Sleep", &1000u64).unwrap_err();
    assert!(err.to_string().contains("handle timeout"), "{err}");
    assert!(start.elapsed() < Duration::from_millis(800));

    // the next request on the same connection still works
    let sum: i32 = client.call("Arith.Sum", &(1, 2)).unwrap();
    assert_eq!(sum, 3);
}

#[test]
fn client_side_call_timeout() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();

    let start = Instant::now();
    let err = client
        .call_timeout::<_, u64>("Arith.Sleep", &500u64, Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, Error::CallTimeout(_)), "{err}");
    assert!(start.elapsed() < Duration::from_millis(400));

    // the late response is dropped by the receiver; the client stays usable
    let sum: i32 = client.call("Arith.Sum", &(3, 4)).unwrap();
    assert_eq!(sum, 7);
}

#[test]
fn close_is_idempotent_guarded() {
    init_logs();
    let (_server, addr) = start_server();
    let client = Client::dial(&addr, &Options::default()).unwrap();
    assert!(client.is_available());

    client.close().unwrap();
    assert!(!client.is_available());
    assert!(matches!(client.close(), Err(Error::Shutdown)));
    assert!(matches!(
        client.call::<_, i32>("Arith.Sum", &(1, 2)),
        Err(Error::Shutdown)
    ));
}

#[test]
fn connect_timeout_against_silent_listener() {
    init_logs();
    // bound but never accepted, and never spoken to: the TCP connect may
    // succeed, the handshake echo never arrives
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let opt = Options {
        connect_timeout: Duration::from_millis(300),
        ..Options::default()
    };
    let start = Instant::now();
    let err = Client::dial(&addr, &opt).unwrap_err();
    assert!(err.to_string().contains("connect timeout"), "{err}");
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn wrong_magic_is_dropped_without_reply() {
    use std::io::{Read, Write};

    init_logs();
    let (_server, addr) = start_server();

    let mut opt = Options::default();
    opt.magic_number = 0x123456;
    let mut stream = std::net::TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut line = serde_json::to_vec(&opt).unwrap();
    line.push(b'\n');
    stream.write_all(&line).unwrap();

    // no echo, just end of stream
    let mut buf = Vec::new();
    let n = stream.read_to_end(&mut buf).unwrap();
    assert_eq!(n, 0);
}
