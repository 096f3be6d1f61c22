//! End-to-end tests: real server threads against the tokio client.

use frame_echo::client::{EchoClient, RetryPolicy};
use frame_echo::config::{ClientConfig, ServerConfig};
use frame_echo::protocol::{encode_frame, FrameHeader, HEADER_LEN, MAGIC};
use frame_echo::runtime::{ConnectionRegistry, EchoServer, ShutdownHandle};
use frame_echo::stats::{Report, Stats};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::watch;

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<Stats>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start() -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            header_timeout: Duration::from_millis(500),
            payload_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        let stats = Arc::new(Stats::new());
        let server = EchoServer::bind(config, Arc::clone(&stats)).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let registry = server.registry();
        let thread = thread::spawn(move || server.run().unwrap());
        Self {
            addr,
            handle,
            registry,
            stats,
            thread: Some(thread),
        }
    }

    fn stop(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
        assert!(self.registry.is_empty());
        assert_eq!(self.registry.buffers_in_use(), 0);
    }
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connections: 1,
        messages_per_conn: 1,
        message_size: 16,
        concurrency: 1,
        retry: RetryPolicy::new(5, Duration::from_secs(2)),
        ..ClientConfig::default()
    }
}

async fn run_client(config: ClientConfig) -> Report {
    let client = EchoClient::new(config, Arc::new(Stats::new()));
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    client.run(cancel_rx).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_message_round_trip() {
    let server = TestServer::start();

    let report = run_client(client_config(server.addr)).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.totals.connections, 1);
    assert_eq!(report.totals.sent, 1);
    assert_eq!(report.totals.received, 1);
    assert_eq!(report.totals.errors, 0);
    assert!(report.totals.avg_round_trip().is_some());

    let server_stats = Arc::clone(&server.stats);
    server.stop();
    let server_totals = server_stats.snapshot();
    assert_eq!(server_totals.received, 1);
    assert_eq!(server_totals.sent, 1);
}

#[test]
fn echoed_bytes_match_request() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let frame = encode_frame(&FrameHeader::new(16, 0), &[b'a'; 16]);
    stream.write_all(&frame).unwrap();

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).unwrap();
    let decoded = FrameHeader::decode(&header).unwrap();
    assert_eq!(decoded, FrameHeader::new(16, 0));
    assert_eq!(decoded.magic, MAGIC);

    let mut payload = [0u8; 16];
    stream.read_exact(&mut payload).unwrap();
    assert_eq!(payload, [b'a'; 16]);

    drop(stream);
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_payload_is_an_error() {
    let server = TestServer::start();

    let config = ClientConfig {
        message_size: 0,
        ..client_config(server.addr)
    };
    let report = run_client(config).await;
    assert_eq!(report.totals.sent, 1);
    assert_eq!(report.totals.received, 0);
    assert_eq!(report.totals.errors, 1);

    assert_eq!(server.stats.snapshot().errors, 1);
    assert_eq!(server.stats.snapshot().sent, 0);
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_times_out_once() {
    // Accepts via the backlog but never answers.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ClientConfig {
        messages_per_conn: 3,
        retry: RetryPolicy::new(3, Duration::from_millis(150)),
        ..client_config(addr)
    };
    let report = run_client(config).await;
    assert_eq!(report.totals.connections, 1);
    assert_eq!(report.totals.sent, 1);
    assert_eq!(report.totals.received, 0);
    assert_eq!(report.totals.errors, 1);
    drop(listener);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_connections_under_load() {
    let server = TestServer::start();

    let config = ClientConfig {
        connections: 40,
        messages_per_conn: 5,
        message_size: 512,
        concurrency: 16,
        ramp_batch: 10,
        ..client_config(server.addr)
    };
    let report = run_client(config).await;
    assert_eq!(report.attempted, 40);
    assert_eq!(report.totals.connections, 40);
    assert_eq!(report.totals.sent, 200);
    assert_eq!(report.totals.received, 200);
    assert_eq!(report.totals.errors, 0);
    assert!(report.throughput() > 0.0);

    let server_stats = Arc::clone(&server.stats);
    server.stop();
    let server_totals = server_stats.snapshot();
    assert_eq!(server_totals.connections, 40);
    assert_eq!(server_totals.received, 200);
    assert_eq!(server_totals.sent, 200);
}

#[test]
fn peer_close_mid_payload_releases_resources() {
    let server = TestServer::start();
    let mut stream = TcpStream::connect(server.addr).unwrap();

    let frame = encode_frame(&FrameHeader::new(64, 1), &[b'a'; 64]);
    stream.write_all(&frame[..HEADER_LEN + 10]).unwrap();
    drop(stream);

    let mut waited = Duration::ZERO;
    let torn_down = || server.stats.snapshot().errors == 1 && server.registry.is_empty();
    while !torn_down() && waited < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(server.stats.snapshot().errors, 1);
    assert!(server.registry.is_empty());
    assert_eq!(server.registry.buffers_in_use(), 0);
    server.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_is_not_counted_as_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ClientConfig {
        retry: RetryPolicy::new(5, Duration::from_secs(5)),
        ..client_config(addr)
    };
    let client = EchoClient::new(config, Arc::new(Stats::new()));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();
        cancel_tx
    });
    let report = client.run(cancel_rx).await;
    let _ = canceller.await;

    assert_eq!(report.totals.connections, 1);
    assert_eq!(report.totals.received, 0);
    assert_eq!(report.totals.errors, 0);
    drop(listener);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_delay_after_final_message() {
    let server = TestServer::start();

    let config = ClientConfig {
        messages_per_conn: 1,
        message_delay: Duration::from_secs(3),
        ..client_config(server.addr)
    };
    let report = run_client(config).await;
    assert_eq!(report.totals.received, 1);
    assert!(report.elapsed < Duration::from_secs(2));
    server.stop();
}
