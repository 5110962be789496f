mod common;

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use simplerpc::{
    heartbeat, Discovery, Options, Registry, RegistryDiscovery, SelectMode, XClient,
    DEFAULT_REGISTRY_PATH,
};

use common::{arith_service, init_logs, start_server_with};

fn start_registry(ttl: Duration) -> (simplerpc::ServerInstance, String) {
    let registry = Registry::new(ttl);
    let instance = registry.start("127.0.0.1:0").unwrap();
    let url = format!("http://{}{}", instance.local_addr(), DEFAULT_REGISTRY_PATH);
    (instance, url)
}

fn raw_exchange(addr: &str, request: &str) -> String {
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn heartbeat_registers_and_expiry_removes() {
    init_logs();
    let (registry, url) = start_registry(Duration::from_millis(300));
    let addr = registry.local_addr().to_string();

    let hb = heartbeat(&url, "tcp@127.0.0.1:1234", Duration::from_millis(100)).unwrap();

    let d = RegistryDiscovery::new(&url, Duration::from_millis(50));
    assert_eq!(d.get_all().unwrap(), vec!["tcp@127.0.0.1:1234".to_owned()]);

    // heartbeats keep the entry alive well past one TTL
    sleep(Duration::from_millis(450));
    let resp = raw_exchange(
        &addr,
        &format!("GET {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n"),
    );
    assert!(resp.contains("tcp@127.0.0.1:1234"), "{resp}");

    // silence the server and age it out
    hb.stop();
    sleep(Duration::from_millis(450));
    let resp = raw_exchange(
        &addr,
        &format!("GET {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n"),
    );
    assert!(!resp.contains("tcp@127.0.0.1:1234"), "{resp}");
    assert_eq!(d.get_all().unwrap(), Vec::<String>::new());
}

#[test]
fn heartbeat_to_dead_registry_fails_fast() {
    init_logs();
    let err = heartbeat(
        "http://127.0.0.1:1/_simplerpc_/registry",
        "tcp@127.0.0.1:1234",
        Duration::from_millis(100),
    );
    assert!(err.is_err());
}

#[test]
fn registry_http_surface() {
    init_logs();
    let (registry, _url) = start_registry(Duration::ZERO);
    let addr = registry.local_addr().to_string();

    // unsupported verbs
    let resp = raw_exchange(
        &addr,
        &format!("DELETE {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n"),
    );
    assert!(resp.starts_with("HTTP/1.0 405"), "{resp}");

    // missing address header
    let resp = raw_exchange(
        &addr,
        &format!("POST {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n"),
    );
    assert!(resp.starts_with("HTTP/1.0 500"), "{resp}");

    // other paths are not served
    let resp = raw_exchange(&addr, "GET /elsewhere HTTP/1.0\r\n\r\n");
    assert!(resp.starts_with("HTTP/1.0 404"), "{resp}");

    // two registrations come back sorted and comma-joined
    for server in ["tcp@2.2.2.2:2", "tcp@1.1.1.1:1"] {
        let resp = raw_exchange(
            &addr,
            &format!(
                "POST {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\nX-Simplerpc-Servers: {server}\r\n\r\n"
            ),
        );
        assert!(resp.starts_with("HTTP/1.0 200"), "{resp}");
    }
    let resp = raw_exchange(
        &addr,
        &format!("GET {DEFAULT_REGISTRY_PATH} HTTP/1.0\r\n\r\n"),
    );
    assert!(
        resp.contains("X-Simplerpc-Servers: tcp@1.1.1.1:1,tcp@2.2.2.2:2"),
        "{resp}"
    );
}

#[test]
fn full_stack_discovery_call() {
    init_logs();
    let (_registry, url) = start_registry(Duration::from_secs(60));

    let (_sa, addr_a) = start_server_with(arith_service());
    let (_sb, addr_b) = start_server_with(arith_service());
    let _hb_a = heartbeat(&url, &format!("tcp@{addr_a}"), Duration::from_secs(10)).unwrap();
    let _hb_b = heartbeat(&url, &format!("tcp@{addr_b}"), Duration::from_secs(10)).unwrap();

    let d = Arc::new(RegistryDiscovery::new(&url, Duration::ZERO));
    let xc = XClient::new(d, SelectMode::RoundRobin, Options::default());

    for i in 0..4i32 {
        let r: i32 = xc.call("Arith.Sum", &(i, i)).unwrap();
        assert_eq!(r, i + i);
    }
    let r: i32 = xc.broadcast("Arith.Sum", &(20, 22)).unwrap();
    assert_eq!(r, 42);
}
