//! Duplex forwarding with per-read idle deadlines and content filtering
//!
//! Provides the unidirectional copy loop, the stream pair driver built on top
//! of it, and the datagram variant used by UDP sessions.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::filter::{FilterPipeline, Filtered};

/// Per-direction forwarding settings
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    /// Maximum bytes read per chunk
    pub buffer_size: usize,
    /// Deadline applied to every read, `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl ForwardOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Why a forwarding direction stopped
#[derive(Debug)]
pub enum Termination {
    /// Sender closed its side
    Eof,
    /// No data within the idle window
    IdleTimeout,
    /// A chunk matched a drop rule
    Dropped(String),
    /// Reading from the sender failed
    Read(io::Error),
    /// Writing to the receiver failed
    Write(io::Error),
    /// The other direction (or the owner) ended the unit
    Closed,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Eof => write!(f, "eof"),
            Termination::IdleTimeout => write!(f, "idle timeout"),
            Termination::Dropped(rule) => write!(f, "dropped by rule '{}'", rule),
            Termination::Read(e) => write!(f, "read error: {}", e),
            Termination::Write(e) => write!(f, "write error: {}", e),
            Termination::Closed => write!(f, "closed"),
        }
    }
}

/// Result of one forwarding direction
#[derive(Debug)]
pub struct ForwardReport {
    /// Bytes written to the receiver
    pub bytes: u64,
    pub termination: Termination,
}

/// Direction of a stream pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound peer to upstream
    Upload,
    /// Upstream to inbound peer
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "inbound->outbound"),
            Direction::Download => write!(f, "outbound->inbound"),
        }
    }
}

/// Result of a stream pair: the direction that ended it and its report
#[derive(Debug)]
pub struct PairReport {
    pub finished: Direction,
    pub report: ForwardReport,
}

/// Read one chunk, bounded by the idle deadline when one is set
async fn read_chunk<R>(
    sender: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> Result<usize, Termination>
where
    R: AsyncRead + Unpin,
{
    let result = match idle_timeout {
        Some(idle) => match tokio::time::timeout(idle, sender.read(buf)).await {
            Ok(result) => result,
            Err(_) => return Err(Termination::IdleTimeout),
        },
        None => sender.read(buf).await,
    };
    match result {
        Ok(0) => Err(Termination::Eof),
        Ok(n) => Ok(n),
        Err(e) => Err(Termination::Read(e)),
    }
}

/// Copy chunks from `sender` to `receiver` until read error, EOF, idle
/// timeout, write error or a dropped chunk
pub async fn forward<R, W>(
    mut sender: R,
    mut receiver: W,
    pipeline: &FilterPipeline,
    opts: ForwardOptions,
) -> ForwardReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; opts.buffer_size];
    let mut bytes = 0u64;

    loop {
        let n = match read_chunk(&mut sender, &mut buf, opts.idle_timeout).await {
            Ok(n) => n,
            Err(termination) => return ForwardReport { bytes, termination },
        };

        let out = match pipeline.apply(&buf[..n]) {
            Filtered::Pass(out) => out,
            Filtered::Drop(rule) => {
                return ForwardReport {
                    bytes,
                    termination: Termination::Dropped(rule),
                }
            }
        };

        if let Err(e) = receiver.write_all(&out).await {
            return ForwardReport {
                bytes,
                termination: Termination::Write(e),
            };
        }
        bytes += out.len() as u64;
    }
}

/// Relay both directions of an established pair until either one ends.
///
/// Both directions run concurrently; the first to finish wins and the other
/// is cancelled. Both streams are dropped (closed) before this returns.
pub async fn relay_pair<A, B>(
    inbound: A,
    outbound: B,
    pipeline: &FilterPipeline,
    opts: ForwardOptions,
) -> PairReport
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (outbound_read, outbound_write) = tokio::io::split(outbound);

    let upload = forward(inbound_read, outbound_write, pipeline, opts);
    let download = forward(outbound_read, inbound_write, pipeline, opts);

    tokio::select! {
        report = upload => PairReport { finished: Direction::Upload, report },
        report = download => PairReport { finished: Direction::Download, report },
    }
}

/// Last-activity clock shared by both directions of a datagram session
#[derive(Debug)]
pub struct ActivityClock {
    start_time: Instant,
    /// Milliseconds since `start_time` of the last datagram seen
    last_activity: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    /// Record activity now
    #[inline]
    pub fn touch(&self) {
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::Release);
    }

    /// Instant of the last recorded activity
    pub fn last_seen(&self) -> Instant {
        self.start_time + Duration::from_millis(self.last_activity.load(Ordering::Acquire))
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }
}

/// Copy datagrams from a connected `upstream` socket back to `peer` through
/// `listener`.
///
/// The idle deadline is measured from the session's last activity in either
/// direction, so traffic from the peer keeps the session alive even while the
/// upstream stays silent.
pub async fn forward_datagrams(
    upstream: &UdpSocket,
    listener: &UdpSocket,
    peer: SocketAddr,
    pipeline: &FilterPipeline,
    opts: ForwardOptions,
    activity: &ActivityClock,
) -> ForwardReport {
    let mut buf = vec![0u8; opts.buffer_size];
    let mut bytes = 0u64;

    loop {
        let result = match opts.idle_timeout {
            Some(idle) => {
                let deadline = activity.last_seen() + idle;
                match tokio::time::timeout_at(deadline, upstream.recv(&mut buf)).await {
                    Ok(result) => result,
                    Err(_) if activity.idle_for() >= idle => {
                        return ForwardReport {
                            bytes,
                            termination: Termination::IdleTimeout,
                        }
                    }
                    // The peer was active meanwhile, wait out the new deadline
                    Err(_) => continue,
                }
            }
            None => upstream.recv(&mut buf).await,
        };

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                return ForwardReport {
                    bytes,
                    termination: Termination::Read(e),
                }
            }
        };
        activity.touch();

        let out = match pipeline.apply(&buf[..n]) {
            Filtered::Pass(out) => out,
            Filtered::Drop(rule) => {
                return ForwardReport {
                    bytes,
                    termination: Termination::Dropped(rule),
                }
            }
        };

        if let Err(e) = listener.send_to(&out, peer).await {
            return ForwardReport {
                bytes,
                termination: Termination::Write(e),
            };
        }
        bytes += out.len() as u64;
    }
}
