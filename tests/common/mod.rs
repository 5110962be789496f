#![allow(dead_code)]

use std::time::Duration;

use may::coroutine;
use simplerpc::{Server, ServerInstance, Service};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The arithmetic test service used across the suites.
pub fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: (i32, i32), reply: &mut i32| {
            *reply = args.0 + args.1;
            Ok(())
        })
        .method("Echo", |s: String, reply: &mut String| {
            *reply = s;
            Ok(())
        })
        .method("Fail", |_: (), _reply: &mut ()| Err("arith says no".to_owned()))
        .method("Sleep", |ms: u64, reply: &mut u64| {
            coroutine::sleep(Duration::from_millis(ms));
            *reply = ms;
            Ok(())
        })
}

/// Start a TCP server hosting the arithmetic service on an ephemeral port.
pub fn start_server() -> (ServerInstance, String) {
    start_server_with(arith_service())
}

pub fn start_server_with(service: Service) -> (ServerInstance, String) {
    let server = Server::new();
    server.register(service).unwrap();
    let instance = server.start("127.0.0.1:0").unwrap();
    let addr = instance.local_addr().to_string();
    (instance, addr)
}
