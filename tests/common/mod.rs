#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use melodyd::command::{CommandDispatcher, CommandExecutor};
use melodyd::config::Config;
use melodyd::listener::Listener;
use melodyd::server::{self, ClientManager};

pub const GREETING: &str = "OK MPD 0.15.0\n";

/// Start a daemon on an ephemeral TCP port with the built-in dispatcher.
pub async fn spawn_server(config: &Config) -> (SocketAddr, ClientManager) {
    spawn_server_with(config, Arc::new(CommandDispatcher::new())).await
}

/// Start a daemon on an ephemeral TCP port with a custom command executor.
pub async fn spawn_server_with(
    config: &Config,
    executor: Arc<dyn CommandExecutor>,
) -> (SocketAddr, ClientManager) {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = ClientManager::new(
        config.limits(),
        config.default_permission_mask().unwrap(),
    );

    tokio::spawn(server::sweep(manager.clone()));
    tokio::spawn(server::serve(manager.clone(), listener, executor));

    (addr, manager)
}

/// Connect and consume the greeting.
pub async fn connect_and_greet(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    read_expect(&mut stream, GREETING).await;
    stream
}

/// Read until exactly `expected` has arrived; panics on mismatching bytes,
/// early close, or a 2 second stall.
pub async fn read_expect(stream: &mut TcpStream, expected: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut received = Vec::new();

    while received.len() < expected.len() {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .unwrap_or_else(|_| panic!(
                "stalled waiting for {expected:?}, got {:?}",
                String::from_utf8_lossy(&received)
            ))
            .unwrap();
        assert!(
            n > 0,
            "connection closed waiting for {expected:?}, got {:?}",
            String::from_utf8_lossy(&received)
        );
        received.extend_from_slice(&buf[..n]);
        assert!(
            expected.as_bytes().starts_with(&received),
            "unexpected reply: {:?}, wanted {expected:?}",
            String::from_utf8_lossy(&received)
        );
    }
}

/// Assert the server closes the connection (EOF or reset), discarding any
/// bytes still in flight.
pub async fn expect_closed(stream: &mut TcpStream) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut buf = vec![0u8; 65536];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) => return,
            Err(_) => panic!("connection was not closed"),
        }
    }
}

/// Assert no bytes arrive for `ms` milliseconds.
pub async fn expect_silence(stream: &mut TcpStream, ms: u64) {
    let mut buf = [0u8; 256];
    match tokio::time::timeout(Duration::from_millis(ms), stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(0)) => panic!("connection closed while expecting silence"),
        Ok(Ok(n)) => panic!(
            "unexpected output: {:?}",
            String::from_utf8_lossy(&buf[..n])
        ),
        Ok(Err(e)) => panic!("read error while expecting silence: {e}"),
    }
}

/// Wait until the manager reports `count` live sessions.
pub async fn wait_for_clients(manager: &ClientManager, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.client_count() != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} clients, have {}",
            manager.client_count()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
