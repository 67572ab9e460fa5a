//! Listener startup and the accept/receive loops
//!
//! This module binds the inbound endpoint and runs the stream accept loop or
//! the datagram receive loop until shutdown or, in strict mode, until the
//! first per-connection error.

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TransportKind;
use crate::core::Relay;
use crate::error::{RelayError, Result};
use crate::handler;
use crate::logger::log;

/// TCP keepalive interval for accepted connections.
/// Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a stream listener with SO_REUSEADDR and the given backlog
pub fn bind_stream_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Bind the inbound datagram socket
pub async fn bind_datagram_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Resolve and bind the listen endpoint, then run the loop for the configured
/// transport
pub async fn run(relay: Arc<Relay>, shutdown: CancellationToken) -> Result<()> {
    let listen = &relay.config.listen;
    let listen_err = |source| RelayError::Listen {
        addr: listen.to_string(),
        source,
    };
    let addr = listen.resolve().await.map_err(listen_err)?;

    match relay.config.transport {
        TransportKind::Tcp => {
            let listener =
                bind_stream_listener(addr, relay.config.tcp_backlog).map_err(listen_err)?;
            run_stream_relay(Arc::clone(&relay), listener, shutdown).await
        }
        TransportKind::Udp => {
            let socket = bind_datagram_listener(addr).await.map_err(listen_err)?;
            run_datagram_relay(Arc::clone(&relay), socket, shutdown).await
        }
    }
}

/// Run the stream accept loop.
///
/// Every accepted connection is handled on its own task. In strict mode the
/// first accept or dial failure ends the loop with that error; otherwise
/// failures are logged and the loop keeps accepting.
pub async fn run_stream_relay(
    relay: Arc<Relay>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        upstream = %relay.config.upstream,
        transport = %TransportKind::Tcp,
        strict = relay.config.strict,
        idle_timeout = ?relay.config.idle_timeout(),
        filter_rules = relay.pipeline.rule_count(),
        "Relay started"
    );

    // Connection tasks report dial failures here when strict
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<RelayError>();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::info!(address = %local_addr, "Relay shutting down");
                return Ok(());
            }
            Some(e) = fatal_rx.recv() => {
                return Err(e);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if relay.config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    // Detect dead peers (mobile disconnect, network change, etc.)
                    set_keepalive(&stream);

                    let relay = Arc::clone(&relay);
                    let fatal_tx = fatal_tx.clone();
                    tokio::spawn(async move {
                        let strict = relay.config.strict;
                        if let Err(e) = handler::handle_stream(relay, stream, addr.to_string()).await {
                            if strict {
                                let _ = fatal_tx.send(e);
                            }
                        }
                    });
                }
                Err(e) => {
                    log::error!(error = %e, "Failed to accept connection");
                    if relay.config.strict {
                        return Err(RelayError::Accept(e));
                    }
                }
            }
        }
    }
}

/// Run the datagram receive loop.
///
/// Datagrams are handled in arrival order on this task so per-peer ordering
/// is kept. All sessions are cancelled when the loop ends.
pub async fn run_datagram_relay(
    relay: Arc<Relay>,
    listener: UdpSocket,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = Arc::new(listener);
    let local_addr = listener.local_addr()?;
    log::info!(
        address = %local_addr,
        upstream = %relay.config.upstream,
        transport = %TransportKind::Udp,
        strict = relay.config.strict,
        idle_timeout = ?relay.config.idle_timeout(),
        filter_rules = relay.pipeline.rule_count(),
        "Relay started"
    );

    let mut buf = BytesMut::zeroed(relay.config.buffer_size);

    let result = loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                log::info!(address = %local_addr, "Relay shutting down");
                break Ok(());
            }
            received = listener.recv_from(&mut buf) => received,
        };

        match received {
            Ok((n, peer)) => {
                log::trace!(peer = %peer, bytes = n, "Datagram received");
                if let Err(e) = handler::handle_datagram(&relay, &listener, peer, &buf[..n]).await {
                    if relay.config.strict {
                        break Err(e);
                    }
                }
            }
            Err(e) => {
                log::error!(error = %e, "Failed to receive datagram");
                if relay.config.strict {
                    break Err(RelayError::Receive(e));
                }
            }
        }
    };

    let cancelled = relay.sessions.cancel_all();
    log::debug!(sessions = cancelled, "Datagram sessions cancelled");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, RelayConfig};

    fn relay(transport: TransportKind, listen: &str, upstream: &str) -> Arc<Relay> {
        let config = RelayConfig::new(
            transport,
            Endpoint::parse(listen, "0.0.0.0").unwrap(),
            Endpoint::parse(upstream, "0.0.0.0").unwrap(),
        );
        Arc::new(Relay::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_bind_stream_listener_ephemeral_port() {
        let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_stream_listener_port_in_use() {
        let first = bind_stream_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind_stream_listener(addr, 16).is_err());
    }

    #[tokio::test]
    async fn test_run_reports_listen_failure() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen = taken.local_addr().unwrap().to_string();
        let relay = relay(TransportKind::Udp, &listen, "127.0.0.1:9");

        let err = run(relay, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Listen { .. }));
        assert!(!err.is_policy_error());
    }

    #[tokio::test]
    async fn test_stream_relay_stops_on_shutdown() {
        let relay = relay(TransportKind::Tcp, "127.0.0.1:0", "127.0.0.1:9");
        let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_stream_relay(relay, listener, shutdown.clone()));
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_datagram_relay_stops_on_shutdown() {
        let relay = relay(TransportKind::Udp, "127.0.0.1:0", "127.0.0.1:9");
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_datagram_relay(relay, socket, shutdown.clone()));
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_accepted_socket_has_keepalive() {
        let listener = bind_stream_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        assert!(!SockRef::from(&stream).keepalive().unwrap());

        set_keepalive(&stream);

        let sock = SockRef::from(&stream);
        assert!(sock.keepalive().unwrap());
        assert_eq!(
            sock.keepalive_time().unwrap(),
            Duration::from_secs(TCP_KEEPALIVE_SECS)
        );
    }
}
