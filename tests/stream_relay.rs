use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protho::config::{Endpoint, FilterRules, RelayConfig, ReplaceRule, TransportKind};
use protho::core::Relay;
use protho::server_runner::{bind_stream_listener, run_stream_relay};
use protho::RelayError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upstream that echoes everything back
async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A local port with nothing listening on it
async fn closed_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
}

fn config(upstream: SocketAddr) -> RelayConfig {
    RelayConfig::new(
        TransportKind::Tcp,
        Endpoint::parse("127.0.0.1:0", "0.0.0.0").unwrap(),
        Endpoint::from(upstream),
    )
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<protho::Result<()>>,
}

fn start(config: RelayConfig) -> Running {
    let relay = Arc::new(Relay::new(config).unwrap());
    let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_stream_relay(relay, listener, shutdown.clone()));
    Running {
        addr,
        shutdown,
        handle,
    }
}

/// Read exactly `len` bytes, failing after two seconds
async fn read_exact_within(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut out))
        .await
        .unwrap()
        .unwrap();
    out
}

/// True once the relay closed the connection (EOF or reset)
async fn closed_within(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(limit, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

#[tokio::test]
async fn test_relays_through_replace_rule() {
    let mut config = config(echo_upstream().await);
    config.filters = FilterRules {
        replace: vec![ReplaceRule {
            old: "hello".to_string(),
            new: "hi".to_string(),
        }],
        ..Default::default()
    };
    let running = start(config);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"hello world").await.unwrap();

    // Replaced once on the way up and echoed back unchanged
    assert_eq!(read_exact_within(&mut client, 8).await, b"hi world");

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let mut config = config(echo_upstream().await);
    config.idle_timeout = Duration::from_millis(200);
    let running = start(config);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 4).await, b"ping");

    assert!(closed_within(&mut client, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_zero_timeout_keeps_connection_open() {
    let running = start(config(echo_upstream().await));

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"one").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 3).await, b"one");

    assert!(!closed_within(&mut client, Duration::from_millis(300)).await);

    client.write_all(b"two").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 3).await, b"two");
}

#[tokio::test]
async fn test_drop_rule_closes_connection() {
    let mut config = config(echo_upstream().await);
    config.filters = FilterRules {
        drop: vec!["DROP".to_string()],
        ..Default::default()
    };
    let running = start(config);

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    assert_eq!(read_exact_within(&mut client, 2).await, b"ok");

    client.write_all(b"please DROP me").await.unwrap();
    assert!(closed_within(&mut client, Duration::from_secs(2)).await);

    // Other connections are unaffected
    let mut other = TcpStream::connect(running.addr).await.unwrap();
    other.write_all(b"still up").await.unwrap();
    assert_eq!(read_exact_within(&mut other, 8).await, b"still up");
}

#[tokio::test]
async fn test_lenient_dial_failure_keeps_accepting() {
    let running = start(config(closed_port().await));

    for _ in 0..2 {
        let mut client = TcpStream::connect(running.addr).await.unwrap();
        assert!(closed_within(&mut client, Duration::from_secs(2)).await);
    }
    assert!(!running.handle.is_finished());

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_strict_dial_failure_stops_relay() {
    let mut config = config(closed_port().await);
    config.strict = true;
    let running = start(config);

    let _client = TcpStream::connect(running.addr).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), running.handle)
        .await
        .unwrap()
        .unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, RelayError::Dial { .. }));
    assert!(err.is_policy_error());
}
