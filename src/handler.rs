//! Connection handling logic
//!
//! Per-connection stream handling and per-datagram session handling. Both
//! dial the upstream endpoint and hand the established pair to the forwarding
//! loops in `core::relay`.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};

use crate::core::{
    forward_datagrams, relay_pair, ForwardReport, PairReport, Relay, Session, Termination,
};
use crate::error::{RelayError, Result};
use crate::filter::Filtered;
use crate::logger::log;

/// Run `connect`, bounded by the relay's connect timeout when one is set
async fn with_connect_timeout<T, F>(relay: &Relay, connect: F) -> Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    let upstream = &relay.config.upstream;
    let result = match relay.config.connect_timeout() {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            )),
        },
        None => connect.await,
    };
    result.map_err(|source| RelayError::Dial {
        addr: upstream.to_string(),
        source,
    })
}

/// Dial a stream connection to the upstream endpoint
pub async fn dial_stream(relay: &Relay) -> Result<TcpStream> {
    let stream = with_connect_timeout(relay, async {
        let addr = relay.config.upstream.resolve().await?;
        TcpStream::connect(addr).await
    })
    .await?;

    if relay.config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    Ok(stream)
}

/// Dial a datagram socket connected to the upstream endpoint.
///
/// The socket is bound to an ephemeral port of the upstream's address family;
/// once connected it only receives datagrams from the upstream.
pub async fn dial_datagram(relay: &Relay) -> Result<UdpSocket> {
    with_connect_timeout(relay, async {
        let addr = relay.config.upstream.resolve().await?;
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    })
    .await
}

/// Handle one accepted stream connection.
///
/// Dials the upstream and relays both directions until either ends. On a dial
/// failure the inbound connection is closed and the error is returned so the
/// accept loop can apply the strict policy.
pub async fn handle_stream(relay: Arc<Relay>, inbound: TcpStream, peer_addr: String) -> Result<()> {
    log::connection(&peer_addr, "new");
    log::debug!(peer = %peer_addr, upstream = %relay.config.upstream, "Connecting to upstream");

    let outbound = match dial_stream(&relay).await {
        Ok(stream) => stream,
        Err(e) => {
            log::error!(peer = %peer_addr, error = %e, "Failed to connect to upstream");
            log::connection(&peer_addr, "closed");
            return Err(e);
        }
    };

    let remote_addr = outbound
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| relay.config.upstream.to_string());
    log::forwarding(&peer_addr, &remote_addr, "started");
    log::forwarding(&remote_addr, &peer_addr, "started");

    let PairReport { finished, report } =
        relay_pair(inbound, outbound, &relay.pipeline, relay.forward_options()).await;

    match &report.termination {
        Termination::Read(_) | Termination::Write(_) => {
            log::debug!(peer = %peer_addr, direction = %finished, bytes = report.bytes, reason = %report.termination, "Relay error");
        }
        Termination::Dropped(_) => {
            log::debug!(peer = %peer_addr, direction = %finished, bytes = report.bytes, reason = %report.termination, "Chunk dropped, closing connection");
        }
        _ => {
            log::trace!(peer = %peer_addr, direction = %finished, bytes = report.bytes, reason = %report.termination, "Relay completed");
        }
    }

    log::forwarding(&peer_addr, &remote_addr, "stopped");
    log::forwarding(&remote_addr, &peer_addr, "stopped");
    log::connection(&peer_addr, "closed");
    Ok(())
}

/// Handle one inbound datagram from `peer`.
///
/// Looks up (or opens) the peer's session, then filters the datagram and
/// sends it upstream. A dropped datagram or a failed send ends the session.
/// Only a dial failure is returned as an error.
pub async fn handle_datagram(
    relay: &Arc<Relay>,
    listener: &Arc<UdpSocket>,
    peer: SocketAddr,
    datagram: &[u8],
) -> Result<()> {
    let session = match relay.sessions.get(&peer) {
        // Ended but not yet removed by its task; replace it with a fresh one
        Some(stale) if stale.is_cancelled() => {
            relay.sessions.remove(&peer, stale.id);
            open_session(relay, listener, peer).await?
        }
        Some(session) => session,
        None => open_session(relay, listener, peer).await?,
    };
    session.activity.touch();

    let out = match relay.pipeline.apply(datagram) {
        Filtered::Pass(out) => out,
        Filtered::Drop(rule) => {
            log::debug!(peer = %peer, rule = %rule, "Datagram dropped, closing session");
            close_session(relay, peer, &session);
            return Ok(());
        }
    };

    if let Err(e) = session.socket.send(&out).await {
        log::debug!(peer = %peer, error = %e, "Failed to send datagram upstream, closing session");
        close_session(relay, peer, &session);
    }
    Ok(())
}

/// End `session` and drop its table entry so the next datagram from `peer`
/// opens a fresh one
fn close_session(relay: &Relay, peer: SocketAddr, session: &Session) {
    session.cancel();
    relay.sessions.remove(&peer, session.id);
}

/// Dial the upstream for a new peer and start its return-path task
async fn open_session(
    relay: &Arc<Relay>,
    listener: &Arc<UdpSocket>,
    peer: SocketAddr,
) -> Result<Session> {
    let peer_addr = peer.to_string();
    log::debug!(peer = %peer_addr, upstream = %relay.config.upstream, "Opening session");

    let socket = match dial_datagram(relay).await {
        Ok(socket) => socket,
        Err(e) => {
            log::error!(peer = %peer_addr, error = %e, "Failed to connect to upstream");
            return Err(e);
        }
    };

    let session = match relay.sessions.insert(peer, socket) {
        Ok(session) => session,
        Err(existing) => return Ok(existing),
    };
    log::session(&peer_addr, "new");

    tokio::spawn(run_session(
        Arc::clone(relay),
        Arc::clone(listener),
        peer,
        session.clone(),
    ));
    Ok(session)
}

/// Forward upstream replies to `peer` until the session ends, then remove it
async fn run_session(relay: Arc<Relay>, listener: Arc<UdpSocket>, peer: SocketAddr, session: Session) {
    let peer_addr = peer.to_string();
    let remote_addr = session
        .socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| relay.config.upstream.to_string());

    // Runs on every exit path, including task abort at runtime shutdown
    let _cleanup = scopeguard::guard((), |_| {
        close_session(&relay, peer, &session);
        log::forwarding(&remote_addr, &peer_addr, "stopped");
        log::session(&peer_addr, "closed");
    });

    log::forwarding(&remote_addr, &peer_addr, "started");

    let report = tokio::select! {
        report = forward_datagrams(
            &session.socket,
            &listener,
            peer,
            &relay.pipeline,
            relay.forward_options(),
            &session.activity,
        ) => report,
        _ = session.cancelled() => ForwardReport {
            bytes: 0,
            termination: Termination::Closed,
        },
    };
    // Stop inbound traffic from reaching the closing upstream socket
    close_session(&relay, peer, &session);

    match &report.termination {
        Termination::IdleTimeout => {
            log::debug!(peer = %peer_addr, idle = ?session.activity.idle_for(), "Session idle, closing");
        }
        Termination::Read(_) | Termination::Write(_) => {
            log::debug!(peer = %peer_addr, bytes = report.bytes, reason = %report.termination, "Session error");
        }
        _ => {
            log::trace!(peer = %peer_addr, bytes = report.bytes, reason = %report.termination, "Session ended");
        }
    }
}
