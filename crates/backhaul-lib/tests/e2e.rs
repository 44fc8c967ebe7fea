//! End-to-end tests: a real server, a real client and local services, all on
//! loopback sockets
//!
//! 1. TCP tunnel with an automatic port relaying to an echo service
//! 2. HTTP tunnel behind Basic-Auth
//! 3. Auth token admission
//! 4. Force-off followed by reconnect
//! 5. Encrypted and compressed payloads
//! 6. Control connection over TLS

use backhaul_lib::{
    extras, ClientOptions, ConnectionListener, ConnectionState, ErrorKind, HeartbeatConfig,
    ReconnectConfig, RetryPolicy, ServerAddrs, ServerConfig, TlsClientSettings, TlsFiles,
    TunnelClient, TunnelError, TunnelRequest, TunnelServer,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// HELPERS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn server_config() -> ServerConfig {
    ServerConfig {
        control_addr: "127.0.0.1:0".parse().unwrap(),
        tcp_bind_host: "127.0.0.1".parse().unwrap(),
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (TunnelServer, ServerAddrs) {
    let server = TunnelServer::new(config);
    let addrs = server.start().await.unwrap();
    (server, addrs)
}

fn client_options() -> ClientOptions {
    ClientOptions {
        heartbeat: HeartbeatConfig::disabled(),
        reconnect: ReconnectConfig {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: None,
        },
        rsa_bits: 1024,
        ..ClientOptions::default()
    }
}

/// Local TCP service that echoes everything back
async fn start_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Local HTTP service answering every request with `hello`; reports the
/// request heads it received
async fn start_http_service() -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (heads_tx, heads_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let heads_tx = heads_tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = heads_tx.send(String::from_utf8_lossy(&head).into_owned());
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (port, heads_rx)
}

async fn round_trip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    public.read_exact(&mut echoed).await.unwrap();
    echoed
}

async fn http_get(addr: std::net::SocketAddr, host: &str, extra_headers: &str) -> String {
    let mut public = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /status HTTP/1.1\r\nHost: {}\r\nUser-Agent: e2e\r\n{}\r\n",
        host, extra_headers
    );
    public.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    public.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(certified.cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(certified.key_pair.serialize_pem().as_bytes())
        .unwrap();
    (cert_path, key_path)
}

// ============================================================================
// SCENARIO 1: TCP tunnel with automatic port
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_tcp_auto_port_echo() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (server, addrs) = start_server(server_config()).await;
        let echo_port = start_echo_service().await;

        let client = TunnelClient::new(client_options());
        let tunnel = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            false,
        );
        let granted = tunnel.wait_established().await.unwrap();
        assert!(granted.remote_port >= 1024);
        assert_eq!(tunnel.state(), ConnectionState::Established);

        assert_eq!(round_trip(granted.remote_port, b"hello tunnel").await, b"hello tunnel");
        assert_eq!(round_trip(granted.remote_port, b"second session").await, b"second session");

        let traffic = tunnel.traffic();
        assert_eq!(traffic.inbound_bytes, 26);
        assert_eq!(traffic.outbound_bytes, 26);

        let snapshots = server.snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].request.remote_port, granted.remote_port);
        assert_eq!(Some(snapshots[0].tunnel_id), tunnel.tunnel_id());
        assert_eq!(snapshots[0].traffic.inbound_bytes, 26);

        tunnel.close();
        tunnel.closed().await;
        while server.tcp_registry().contains(&granted.remote_port) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.shutdown().await;
    })
    .await
    .unwrap();
}

// ============================================================================
// SCENARIO 2: HTTP tunnel behind Basic-Auth
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_http_basic_auth() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (server, addrs) = start_server(server_config()).await;
        let http_addr = addrs.http.unwrap();
        let (http_port, mut heads) = start_http_service().await;

        let client = TunnelClient::new(client_options());
        let request = TunnelRequest::http("127.0.0.1", http_port, "t1.tunnel.lo")
            .with_extra(extras::ENABLE_BASIC_AUTH, "true")
            .with_extra(extras::BASIC_AUTH_USERNAME, "tp")
            .with_extra(extras::BASIC_AUTH_PASSWORD, "s3cret")
            .with_extra(extras::ADD_HEADERS, r#"{"X-Forwarded-By":"backhaul"}"#);
        let tunnel = client.connect(addrs.control.to_string(), request, false);
        tunnel.wait_established().await.unwrap();

        let challenged = http_get(http_addr, "t1.tunnel.lo", "").await;
        assert!(challenged.starts_with("HTTP/1.1 401"), "{}", challenged);
        assert!(challenged.contains("WWW-Authenticate: Basic"));

        let wrong = http_get(http_addr, "t1.tunnel.lo", "Authorization: Basic dHA6d3Jvbmc=\r\n").await;
        assert!(wrong.starts_with("HTTP/1.1 401"));

        let response = http_get(
            http_addr,
            "T1.Tunnel.LO:8080",
            "Authorization: Basic dHA6czNjcmV0\r\n",
        )
        .await;
        assert_eq!(
            response,
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
        );

        // Only the authenticated request reached the local service
        let head = heads.recv().await.unwrap();
        assert!(head.starts_with("GET /status HTTP/1.1\r\n"));
        assert!(!head.to_ascii_lowercase().contains("authorization"));
        assert!(head.contains("X-Forwarded-By: backhaul\r\n"));
        assert!(heads.try_recv().is_err());

        let unknown = http_get(http_addr, "t2.tunnel.lo", "").await;
        assert!(unknown.starts_with("HTTP/1.1 404"));

        client.close_all();
        server.shutdown().await;
    })
    .await
    .unwrap();
}

// ============================================================================
// SCENARIO 3: Auth token admission
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_auth_token_rejection() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (server, addrs) = start_server(ServerConfig {
            auth_token: Some("tok1".to_string()),
            ..server_config()
        })
        .await;
        let echo_port = start_echo_service().await;

        let disconnects = Arc::new(AtomicUsize::new(0));
        let listener = {
            let disconnects = disconnects.clone();
            ConnectionListener::default().on_disconnected(move |_, error| {
                if matches!(error, Some(TunnelError::Rejected(_))) {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let client = TunnelClient::new(ClientOptions {
            retry: RetryPolicy::NEVER.with_retry_on_disconnect(),
            ..client_options()
        })
        .with_listener(listener);

        let missing = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            false,
        );
        let err = missing.wait_established().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Admission);
        assert_eq!(err.rejection_reason(), Some("bad auth token"));

        let mismatched = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0).with_extra(extras::AUTH_TOKEN, "tok2"),
            false,
        );
        assert_eq!(
            mismatched.wait_established().await.unwrap_err(),
            TunnelError::Rejected("bad auth token".to_string())
        );
        assert!(server.tcp_registry().is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);

        let accepted = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0).with_extra(extras::AUTH_TOKEN, "tok1"),
            false,
        );
        let granted = accepted.wait_established().await.unwrap();
        assert_eq!(round_trip(granted.remote_port, b"let me in").await, b"let me in");
        assert_eq!(client.connections().len(), 1);

        client.close_all();
        server.shutdown().await;
    })
    .await
    .unwrap();
}

// ============================================================================
// SCENARIO 4: Force-off and reconnect
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_force_off_reconnects() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (server, addrs) = start_server(server_config()).await;
        let echo_port = start_echo_service().await;

        let established = Arc::new(AtomicUsize::new(0));
        let listener = {
            let established = established.clone();
            ConnectionListener::default().on_connected(move |_| {
                established.fetch_add(1, Ordering::SeqCst);
            })
        };
        let client = TunnelClient::new(client_options()).with_listener(listener);
        let tunnel = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            false,
        );
        let first = tunnel.wait_established().await.unwrap();
        let first_id = tunnel.tunnel_id();

        // An open session that the force-off must close
        let mut public = TcpStream::connect(("127.0.0.1", first.remote_port)).await.unwrap();
        public.write_all(b"still there?").await.unwrap();
        let mut buf = [0u8; 12];
        public.read_exact(&mut buf).await.unwrap();

        server.force_off_tcp(first.remote_port).unwrap();

        let mut rest = Vec::new();
        public.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut status = tunnel.subscribe();
        status
            .wait_for(|s| s.state == ConnectionState::Established && s.tunnel_id != first_id)
            .await
            .unwrap();
        drop(status);
        assert_eq!(established.load(Ordering::SeqCst), 2);

        let second = tunnel.established_request().unwrap();
        assert_eq!(round_trip(second.remote_port, b"back again").await, b"back again");

        client.close_all();
        server.shutdown().await;
    })
    .await
    .unwrap();
}

// ============================================================================
// ENCRYPTION AND COMPRESSION
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_encrypted_compressed_round_trip() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (server, addrs) = start_server(server_config()).await;
        let echo_port = start_echo_service().await;

        let client = TunnelClient::new(ClientOptions {
            compress: true,
            ..client_options()
        });
        let tunnel = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            true,
        );
        let granted = tunnel.wait_established().await.unwrap();

        let descriptor = server.tcp_registry().get(&granted.remote_port).unwrap();
        assert!(descriptor.payload().is_encrypted());
        assert!(descriptor.payload().compresses());

        let compressible: Vec<u8> = b"backhaul ".iter().copied().cycle().take(64 * 1024).collect();
        assert_eq!(round_trip(granted.remote_port, &compressible).await, compressible);

        let noise: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        assert_eq!(round_trip(granted.remote_port, &noise).await, noise);

        client.close_all();
        server.shutdown().await;
    })
    .await
    .unwrap();
}

// ============================================================================
// CONTROL CONNECTION OVER TLS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_tls_control_connection() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());

        let (server, addrs) = start_server(ServerConfig {
            tls: Some(TlsFiles {
                cert_path: cert_path.clone(),
                key_path,
            }),
            control_tls: true,
            ..server_config()
        })
        .await;
        let echo_port = start_echo_service().await;

        let tls = TlsClientSettings::new(Some(cert_path.as_path()))
            .unwrap()
            .with_server_name("localhost");
        let client = TunnelClient::new(ClientOptions {
            tls: Some(tls),
            ..client_options()
        });
        let tunnel = client.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            false,
        );
        let granted = tunnel.wait_established().await.unwrap();
        assert_eq!(round_trip(granted.remote_port, b"over tls").await, b"over tls");

        // A plain client cannot speak to the TLS control port
        let plain = TunnelClient::new(ClientOptions {
            retry: RetryPolicy::NEVER,
            ..client_options()
        });
        let refused = plain.connect(
            addrs.control.to_string(),
            TunnelRequest::tcp("127.0.0.1", echo_port, 0),
            false,
        );
        assert!(refused.wait_established().await.is_err());

        client.close_all();
        server.shutdown().await;
    })
    .await
    .unwrap();
}
