//! Integration tests for session lifecycle: admission, timeouts, slow-peer
//! backpressure, output ordering, and daemon shutdown.

mod common;

use common::*;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use melodyd::client::Client;
use melodyd::command::{CommandDispatcher, CommandExecutor, CommandResult};
use melodyd::config::Config;
use melodyd::listener::Stream;

/// Dispatcher wrapper adding output-heavy verbs used to exercise the
/// deferred queue: `flood <bytes>` writes unstructured filler, `count <n>`
/// writes numbered lines.
struct NoisyExecutor {
    inner: CommandDispatcher,
}

impl NoisyExecutor {
    fn new() -> Self {
        Self {
            inner: CommandDispatcher::new(),
        }
    }
}

impl CommandExecutor for NoisyExecutor {
    fn process(&self, client: &mut Client, sock: &Stream, line: &str) -> CommandResult {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("flood") => {
                let total: usize = parts.next().unwrap().parse().unwrap();
                let chunk = [b'z'; 4096];
                let mut sent = 0;
                while sent < total && !client.is_expired() {
                    let n = chunk.len().min(total - sent);
                    client.write(sock, &chunk[..n]);
                    sent += n;
                }
                CommandResult::Ok
            }
            Some("count") => {
                let n: usize = parts.next().unwrap().parse().unwrap();
                for i in 0..n {
                    client.write_args(sock, format_args!("{i}\n"));
                }
                CommandResult::Ok
            }
            _ => self.inner.process(client, sock, line),
        }
    }

    fn process_list(
        &self,
        client: &mut Client,
        sock: &Stream,
        with_acks: bool,
        lines: &[String],
    ) -> CommandResult {
        self.inner.process_list(client, sock, with_acks, lines)
    }
}

#[tokio::test]
async fn connection_cap_closes_excess_connections_without_greeting() {
    let config = Config {
        max_connections: 2,
        ..Config::default()
    };
    let (addr, manager) = spawn_server(&config).await;

    let _first = connect_and_greet(addr).await;
    let _second = connect_and_greet(addr).await;
    wait_for_clients(&manager, 2).await;

    let mut third = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), third.read(&mut buf))
        .await
        .expect("rejected connection should close promptly")
        .unwrap();
    assert_eq!(n, 0, "no greeting for a rejected connection");
    assert_eq!(manager.client_count(), 2);
}

#[tokio::test]
async fn closing_a_session_frees_a_slot() {
    let config = Config {
        max_connections: 1,
        ..Config::default()
    };
    let (addr, manager) = spawn_server(&config).await;

    let first = connect_and_greet(addr).await;
    wait_for_clients(&manager, 1).await;
    drop(first);
    wait_for_clients(&manager, 0).await;

    let _second = connect_and_greet(addr).await;
}

#[tokio::test]
async fn silent_sessions_are_closed_after_the_timeout() {
    let config = Config {
        connection_timeout: 1,
        ..Config::default()
    };
    let (addr, manager) = spawn_server(&config).await;

    let mut stream = connect_and_greet(addr).await;
    wait_for_clients(&manager, 1).await;

    expect_closed(&mut stream).await;
    wait_for_clients(&manager, 0).await;
}

#[tokio::test]
async fn activity_resets_the_inactivity_timer() {
    let config = Config {
        connection_timeout: 1,
        ..Config::default()
    };
    let (addr, _manager) = spawn_server(&config).await;
    let mut stream = connect_and_greet(addr).await;

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stream.write_all(b"ping\n").await.unwrap();
        read_expect(&mut stream, "OK\n").await;
    }
}

#[tokio::test]
async fn flooding_a_non_reading_peer_expires_the_session() {
    let config = Config {
        max_output_buffer_size: 64,
        ..Config::default()
    };
    let (addr, manager) = spawn_server_with(&config, Arc::new(NoisyExecutor::new())).await;

    let mut stream = connect_and_greet(addr).await;
    wait_for_clients(&manager, 1).await;

    // 64 MiB against a 64 KiB deferred-output limit; we never read, so
    // once the kernel socket buffers fill the queue overflows and the
    // session is expired. The flood is sized well past what loopback
    // buffer auto-tuning can absorb.
    stream.write_all(b"flood 67108864\n").await.unwrap();

    expect_closed(&mut stream).await;
    wait_for_clients(&manager, 0).await;
}

#[tokio::test]
async fn slow_reader_receives_bytes_in_production_order() {
    let (addr, _manager) = spawn_server_with(
        &Config::default(),
        Arc::new(NoisyExecutor::new()),
    ).await;

    let mut stream = connect_and_greet(addr).await;

    let lines = 50_000usize;
    stream
        .write_all(format!("count {lines}\n").as_bytes())
        .await
        .unwrap();

    // Read in small pieces, with pauses early on so output backs up into
    // the deferred queue before we drain it.
    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut buf = [0u8; 1024];
    loop {
        if received.ends_with(b"\nOK\n") {
            break;
        }
        let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
            .await
            .expect("reply within deadline")
            .unwrap();
        assert!(n > 0, "connection closed mid-reply");
        received.extend_from_slice(&buf[..n]);
        if received.len() < 64 * 1024 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    let text = String::from_utf8(received).unwrap();
    let mut parts = text.lines();
    for expected in 0..lines {
        assert_eq!(parts.next().unwrap(), expected.to_string());
    }
    assert_eq!(parts.next(), Some("OK"));
    assert_eq!(parts.next(), None);
}

#[tokio::test]
async fn close_verb_drops_the_connection() {
    let (addr, manager) = spawn_server(&Config::default()).await;
    let mut stream = connect_and_greet(addr).await;
    wait_for_clients(&manager, 1).await;

    stream.write_all(b"close\n").await.unwrap();
    expect_closed(&mut stream).await;
    wait_for_clients(&manager, 0).await;
}

#[tokio::test]
async fn kill_verb_shuts_the_daemon_down() {
    let (addr, manager) = spawn_server(&Config::default()).await;
    let mut stream = connect_and_greet(addr).await;
    let mut other = connect_and_greet(addr).await;
    wait_for_clients(&manager, 2).await;

    stream.write_all(b"kill\n").await.unwrap();

    expect_closed(&mut stream).await;
    expect_closed(&mut other).await;
    wait_for_clients(&manager, 0).await;
    assert!(manager.shutdown_token().is_cancelled());
}
