//! Integration tests for Culvert
//!
//! Exercises the full client-server flow over loopback sockets:
//! - Control channel handshake and supervision
//! - Tunnel pool pairing and bidirectional streaming
//! - Mux sessions with stream budgets
//! - UDP forwarding

use culvert::client::{MuxClient, TcpClient};
use culvert::config::{ClientConfig, ServerConfig, TransportMode};
use culvert::control;
use culvert::protocol::{self, Signal};
use culvert::server::{MuxServer, TcpServer};
use culvert::Endpoint;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Grab a free loopback port by binding and dropping a listener.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP echo service used as the "private" backend.
async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = conn.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// UDP echo service.
async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// Connect to a public port, retrying while the tunnel comes up.
async fn connect_retry(addr: SocketAddr, deadline: Duration) -> TcpStream {
    let give_up = tokio::time::Instant::now() + deadline;
    loop {
        match TcpStream::connect(addr).await {
            Ok(conn) => return conn,
            Err(_) if tokio::time::Instant::now() < give_up => {
                sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("public port never came up: {e}"),
        }
    }
}

fn server_config(tunnel_port: u16, mapping: String, transport: TransportMode) -> ServerConfig {
    ServerConfig {
        bind_addr: format!("127.0.0.1:{tunnel_port}"),
        token: "integration-token".to_string(),
        transport,
        ports: vec![mapping],
        keepalive_secs: 30,
        heartbeat_secs: 30,
        channel_size: 64,
        ..ServerConfig::default()
    }
}

fn client_config(tunnel_port: u16, transport: TransportMode, pool: usize) -> ClientConfig {
    ClientConfig {
        remote_addr: format!("127.0.0.1:{tunnel_port}"),
        token: "integration-token".to_string(),
        transport,
        keepalive_secs: 30,
        retry_interval_secs: 1,
        dial_timeout_secs: 2,
        conn_pool_size: pool,
        ..ClientConfig::default()
    }
}

/// Authenticate a bare control channel with no tunnel pool behind it. While
/// the returned connection is held open, the server believes a client is
/// attached but no tunnel connections ever arrive.
async fn fake_control_channel(tunnel: SocketAddr, token: &str) -> TcpStream {
    let give_up = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(mut conn) = TcpStream::connect(tunnel).await {
            if control::client_handshake(&mut conn, token).await.is_ok() {
                return conn;
            }
        }
        assert!(
            tokio::time::Instant::now() < give_up,
            "control channel never established"
        );
        sleep(Duration::from_millis(100)).await;
    }
}

/// Act as one client tunnel connection: dial the server, wait to be paired,
/// then relay between the tunnel and the forwarded target.
async fn serve_one_tunnel(tunnel: SocketAddr) {
    let mut conn = TcpStream::connect(tunnel).await.unwrap();
    let (tag, target) = protocol::recv_tagged_string(&mut conn).await.unwrap();
    assert_eq!(tag, Signal::Tcp);

    let mut local = TcpStream::connect(target).await.unwrap();
    let _ = tokio::io::copy_bidirectional(&mut conn, &mut local).await;
}

async fn echo_roundtrip(public: SocketAddr, payload: &[u8]) {
    let mut user = connect_retry(public, Duration::from_secs(5)).await;
    user.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(3), user.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_tcp_tunnel_end_to_end() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;
    let public: SocketAddr = format!("127.0.0.1:{public_port}").parse().unwrap();

    let parent = CancellationToken::new();
    let server = TcpServer::new(
        server_config(
            tunnel_port,
            format!("127.0.0.1:{public_port}={echo}"),
            TransportMode::Tcp,
        ),
        parent.clone(),
    )
    .unwrap();
    let client = TcpClient::new(client_config(tunnel_port, TransportMode::Tcp, 2), parent.clone());

    let server_task = tokio::spawn(server.clone().run());
    let client_task = tokio::spawn(client.clone().run());

    echo_roundtrip(public, b"hello").await;
    echo_roundtrip(public, b"second connection").await;

    // Both directions were accounted to the public port
    let mut observed = 0;
    for _ in 0..30 {
        observed = server.usage().port_total(public_port);
        if observed >= 2 * (5 + 17) as u64 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(observed >= 2 * (5 + 17) as u64, "usage: {observed}");

    // The pool replaces consumed connections and settles back at the floor
    let mut inflight = -1;
    for _ in 0..30 {
        inflight = client.pool_state().pool_inflight.load(Ordering::Relaxed);
        if inflight == 2 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(inflight, 2);

    // Cancellation propagates into every task
    parent.cancel();
    timeout(Duration::from_secs(5), server_task).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), client_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_large_transfer_through_tunnel() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;
    let public: SocketAddr = format!("127.0.0.1:{public_port}").parse().unwrap();

    let parent = CancellationToken::new();
    let server = TcpServer::new(
        server_config(
            tunnel_port,
            format!("127.0.0.1:{public_port}={echo}"),
            TransportMode::Tcp,
        ),
        parent.clone(),
    )
    .unwrap();
    let client = TcpClient::new(client_config(tunnel_port, TransportMode::Tcp, 1), parent.clone());

    tokio::spawn(server.run());
    tokio::spawn(client.run());

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let user = connect_retry(public, Duration::from_secs(5)).await;
    let (mut user_read, mut user_write) = user.into_split();

    let expected = payload.clone();
    // Keep the write half alive until the echo has fully returned; closing
    // either direction tears down the whole pair
    let writer = tokio::spawn(async move {
        user_write.write_all(&payload).await.unwrap();
        user_write
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(10), user_read.read_exact(&mut received))
        .await
        .expect("transfer timed out")
        .unwrap();
    assert_eq!(received, expected);

    let _user_write = writer.await.unwrap();
    parent.cancel();
}

#[tokio::test]
async fn test_bad_token_passes_no_traffic() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;

    let parent = CancellationToken::new();
    let mut bad_server_config = server_config(
        tunnel_port,
        format!("127.0.0.1:{public_port}={echo}"),
        TransportMode::Tcp,
    );
    bad_server_config.token = "server-token".to_string();

    let mut bad_client_config = client_config(tunnel_port, TransportMode::Tcp, 2);
    bad_client_config.token = "client-token".to_string();

    let server = TcpServer::new(bad_server_config, parent.clone()).unwrap();
    let client = TcpClient::new(bad_client_config, parent.clone());

    tokio::spawn(server.run());
    tokio::spawn(client.run());

    // With no established control channel the public listeners never start
    sleep(Duration::from_secs(2)).await;
    assert!(
        TcpStream::connect(format!("127.0.0.1:{public_port}"))
            .await
            .is_err(),
        "public port must stay closed without an authenticated tunnel"
    );

    parent.cancel();
}

#[tokio::test]
async fn test_mux_tunnel_with_stream_budget() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;
    let public: SocketAddr = format!("127.0.0.1:{public_port}").parse().unwrap();

    let parent = CancellationToken::new();
    let mut mux_server_config = server_config(
        tunnel_port,
        format!("127.0.0.1:{public_port}={echo}"),
        TransportMode::Tcpmux,
    );
    // Small budget so this test exercises session retirement
    mux_server_config.mux.mux_con = 2;

    let server = MuxServer::new(mux_server_config, parent.clone()).unwrap();
    let client = MuxClient::new(
        client_config(tunnel_port, TransportMode::Tcpmux, 2),
        parent.clone(),
    )
    .unwrap();

    tokio::spawn(server.run());
    tokio::spawn(client.run());

    // More connections than one session may carry
    for i in 0..5u8 {
        let payload = format!("mux stream {i}");
        echo_roundtrip(public, payload.as_bytes()).await;
    }

    // Concurrent connections across session boundaries
    let mut tasks = Vec::new();
    for i in 0..3u8 {
        tasks.push(tokio::spawn(async move {
            echo_roundtrip(public, format!("concurrent {i}").as_bytes()).await;
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    }

    parent.cancel();
}

#[tokio::test]
async fn test_udp_forwarding() {
    let udp_echo = spawn_udp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;

    let parent = CancellationToken::new();
    let mut udp_server_config = server_config(
        tunnel_port,
        format!("127.0.0.1:{public_port}={udp_echo}"),
        TransportMode::Tcp,
    );
    udp_server_config.accept_udp = true;

    let server = TcpServer::new(udp_server_config, parent.clone()).unwrap();
    let client = TcpClient::new(client_config(tunnel_port, TransportMode::Tcp, 2), parent.clone());

    tokio::spawn(server.run());
    tokio::spawn(client.run());

    let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    user.connect(format!("127.0.0.1:{public_port}")).await.unwrap();

    // The tunnel needs a moment to establish; keep probing until the echo
    // comes back
    let mut buf = [0u8; 64];
    let mut echoed = None;
    for _ in 0..50 {
        let _ = user.send(b"udp ping").await;
        match timeout(Duration::from_millis(200), user.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                echoed = Some(buf[..n].to_vec());
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(echoed.as_deref(), Some(&b"udp ping"[..]));

    parent.cancel();
}

#[tokio::test]
async fn test_backpressure_drops_excess_connection() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;
    let tunnel: SocketAddr = format!("127.0.0.1:{tunnel_port}").parse().unwrap();
    let public: SocketAddr = format!("127.0.0.1:{public_port}").parse().unwrap();

    let parent = CancellationToken::new();
    let mut small_queue_config = server_config(
        tunnel_port,
        format!("127.0.0.1:{public_port}={echo}"),
        TransportMode::Tcp,
    );
    small_queue_config.channel_size = 2;

    let server = TcpServer::new(small_queue_config, parent.clone()).unwrap();
    tokio::spawn(server.run());

    // A control channel with no pool behind it: pairing is stalled
    let _control = fake_control_channel(tunnel, "integration-token").await;

    // Every pairing worker parks one connection, then the queue holds its
    // bound; the connection after that must be dropped, not queued
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4);
    let mut parked = Vec::new();
    for _ in 0..workers {
        parked.push(connect_retry(public, Duration::from_secs(5)).await);
        sleep(Duration::from_millis(50)).await;
    }
    sleep(Duration::from_millis(300)).await;
    for _ in 0..2 {
        parked.push(connect_retry(public, Duration::from_secs(5)).await);
        sleep(Duration::from_millis(50)).await;
    }
    sleep(Duration::from_millis(200)).await;

    let mut excess = TcpStream::connect(public).await.unwrap();
    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(2), excess.read(&mut probe))
        .await
        .expect("overflow connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0, "overflow connection should see EOF");

    // Unstall: hand the server one tunnel connection per parked user; every
    // parked connection is then served
    for _ in 0..parked.len() {
        tokio::spawn(serve_one_tunnel(tunnel));
    }
    for (i, mut user) in parked.into_iter().enumerate() {
        let payload = format!("parked {i}");
        user.write_all(payload.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        timeout(Duration::from_secs(5), user.read_exact(&mut buf))
            .await
            .expect("parked connection was not served")
            .unwrap();
        assert_eq!(buf, payload.as_bytes());
    }

    parent.cancel();
}

#[tokio::test]
async fn test_server_restart_mid_stream() {
    let echo = spawn_tcp_echo().await;
    let tunnel_port = free_port().await;
    let public_port = free_port().await;
    let public: SocketAddr = format!("127.0.0.1:{public_port}").parse().unwrap();

    let parent = CancellationToken::new();
    let server = TcpServer::new(
        server_config(
            tunnel_port,
            format!("127.0.0.1:{public_port}={echo}"),
            TransportMode::Tcp,
        ),
        parent.clone(),
    )
    .unwrap();
    tokio::spawn(server.run());

    // First client under its own token so it can be torn down alone
    let first_client_parent = CancellationToken::new();
    let first_client = TcpClient::new(
        client_config(tunnel_port, TransportMode::Tcp, 2),
        first_client_parent.clone(),
    );
    let first_client_task = tokio::spawn(first_client.run());

    // An active stream through the tunnel
    let mut user = connect_retry(public, Duration::from_secs(5)).await;
    user.write_all(b"before restart").await.unwrap();
    let mut buf = [0u8; 14];
    timeout(Duration::from_secs(3), user.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"before restart");

    // Kill the client; its farewell drives the server through Restart
    first_client_parent.cancel();
    timeout(Duration::from_secs(5), first_client_task)
        .await
        .unwrap()
        .unwrap();

    // The in-flight user connection is torn down with the old cycle
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), user.read_to_end(&mut rest))
        .await
        .expect("user connection was not torn down after restart")
        .ok();

    // Sit out the server's drain window so nothing can race the old cycle's
    // listeners, then reattach; new user connections succeed
    sleep(Duration::from_secs(2)).await;
    let second_client = TcpClient::new(
        client_config(tunnel_port, TransportMode::Tcp, 2),
        parent.clone(),
    );
    tokio::spawn(second_client.run());

    let mut user2 = connect_retry(public, Duration::from_secs(15)).await;
    user2.write_all(b"after restart").await.unwrap();
    let mut buf2 = [0u8; 13];
    timeout(Duration::from_secs(5), user2.read_exact(&mut buf2))
        .await
        .expect("echo after restart timed out")
        .unwrap();
    assert_eq!(&buf2, b"after restart");

    parent.cancel();
}

#[tokio::test]
async fn test_client_outlives_unreachable_server() {
    // A client pointed at a dead endpoint must keep retrying, not crash,
    // and still shut down cleanly on cancel.
    let tunnel_port = free_port().await;

    let parent = CancellationToken::new();
    let client = TcpClient::new(client_config(tunnel_port, TransportMode::Tcp, 1), parent.clone());
    let task = tokio::spawn(client.run());

    sleep(Duration::from_millis(1500)).await;
    assert!(!task.is_finished());

    parent.cancel();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}
