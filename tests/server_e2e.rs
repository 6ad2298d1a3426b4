//! End-to-end: the `cpias serve` binary answering real TCP clients.

use std::net::TcpListener as StdTcpListener;
use std::process::Stdio;
use std::time::Duration;

use cpias::daemon::protocol::version_line;
use cpias::daemon::{Client, Message};
use serde_json::json;
use tokio::process::{Child, Command};

struct ServeProcess {
    child: Child,
    port: u16,
}

impl ServeProcess {
    async fn start() -> Self {
        let port = free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_cpias"))
            .args(["serve", "-H", "127.0.0.1", "-p", &port.to_string()])
            .env("CPIAS_POLL_INTERVAL_MS", "100")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        Self { child, port }
    }

    async fn connect(&self) -> (Client, String) {
        for _ in 0..100 {
            if let Ok(connected) = Client::connect(("127.0.0.1", self.port)).await {
                return connected;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("server did not start on port {}", self.port);
    }
}

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn request(client: &mut Client, command: &str, data: serde_json::Value) -> Message {
    client
        .send(&Message::new("client-1", command, data))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(30), client.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_hello_roundtrip() {
    let server = ServeProcess::start().await;
    let (mut client, greeting) = server.connect().await;
    assert_eq!(greeting, version_line());

    let reply = request(&mut client, "hello", json!({"planet": "world"})).await;

    assert_eq!(reply, Message::new("client-1", "hello", json!({"planet": "world"})));
}

#[tokio::test]
async fn test_all_offload_strategies() {
    let server = ServeProcess::start().await;
    let (mut client, _) = server.connect().await;

    let reply = request(&mut client, "hello_slow", json!({"planet": "mars"})).await;
    assert_eq!(reply.data["result"], "333333283333335000000");

    let reply = request(&mut client, "hello_persistent", json!({"planet": "mars"})).await;
    assert_eq!(reply.data["old_planet"], "init");
    assert_eq!(reply.data["new_planet"], "mars");

    let reply = request(&mut client, "hello_process", json!({"planet": "venus"})).await;
    assert_eq!(reply.data["old_planet"], "init");
    assert_eq!(reply.data["new_planet"], "venus");

    // Worker state is shared across connections
    let (mut other, _) = server.connect().await;
    let reply = request(&mut other, "hello_process", json!({})).await;
    assert_eq!(reply.data["old_planet"], "venus");
    assert_eq!(reply.data["new_planet"], "Jupiter");
}

#[tokio::test]
async fn test_bad_requests_get_no_reply() {
    let server = ServeProcess::start().await;
    let (mut client, _) = server.connect().await;

    client.send_line("this is not json").await.unwrap();
    client
        .send_line(r#"{"cli": "client-1", "cmd": "nope", "dta": {}}"#)
        .await
        .unwrap();
    let reply = request(&mut client, "hello", json!({"planet": 3})).await;
    assert_eq!(reply.command_name(), "invalid");

    let reply = request(&mut client, "hello", json!({})).await;
    assert_eq!(reply.command_name(), "hello");
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_stops_server_and_workers() {
    let mut server = ServeProcess::start().await;
    let (mut client, _) = server.connect().await;
    request(&mut client, "hello_process", json!({"planet": "mars"})).await;

    let pid = libc::pid_t::try_from(server.child.id().unwrap()).unwrap();
    // SAFETY: pid is our own, still running child
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

    let status = tokio::time::timeout(Duration::from_secs(10), server.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}
