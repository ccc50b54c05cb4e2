//! Push-stream connections
//!
//! A stream connection moves strictly forward through
//!
//! ```text
//! Init -> HeadersSent -> Registered -> Live -> Deregistered -> Closed
//! ```
//!
//! Once registered it receives the current snapshot immediately, then every
//! broadcast frame, plus a heartbeat comment whenever nothing was written for
//! a whole idle window. Reads from the peer only detect that it went away;
//! no further requests are processed on the connection.

use crate::network::http::write_all_timeout;
use crate::network::hub::{HubError, SubscriberHub, Subscription};
use crate::usb::DeviceRegistry;
use common::Shutdown;
use protocol::{HEARTBEAT_FRAME, encode_snapshot_frame};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

/// Default idle window before a heartbeat is sent
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Response head for the stream endpoint
pub const STREAM_RESPONSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\
Access-Control-Allow-Origin: *\r\n\
\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Init,
    HeadersSent,
    Registered,
    Live,
    Deregistered,
    Closed,
}

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Peer closed its side
    PeerClosed,
    /// Reading from or writing to the peer failed
    IoError,
    /// The hub dropped this subscriber or was closed
    Dropped,
    /// Subscriber limit reached at registration
    Rejected,
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub heartbeat: Duration,
    pub write_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            write_timeout: crate::network::http::DEFAULT_WRITE_TIMEOUT,
        }
    }
}

pub struct EventStream<'a, R, W> {
    reader: R,
    writer: W,
    peer: SocketAddr,
    state: StreamState,
    registry: &'a DeviceRegistry,
    hub: &'a SubscriberHub,
    shutdown: &'a Shutdown,
    options: StreamOptions,
}

impl<'a, R, W> EventStream<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: R,
        writer: W,
        peer: SocketAddr,
        registry: &'a DeviceRegistry,
        hub: &'a SubscriberHub,
        shutdown: &'a Shutdown,
        options: StreamOptions,
    ) -> Self {
        Self {
            reader,
            writer,
            peer,
            state: StreamState::Init,
            registry,
            hub,
            shutdown,
            options,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn advance(&mut self, next: StreamState) {
        debug_assert!(next > self.state, "stream state may only move forward");
        trace!("Stream {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    /// Drive the connection until it ends, always finishing in `Closed`
    pub async fn run(mut self) -> StreamEnd {
        let end = self.serve().await;
        self.finish().await;
        info!("Stream {} ended: {:?}", self.peer, end);
        end
    }

    async fn serve(&mut self) -> StreamEnd {
        if let Err(e) = self.write(STREAM_RESPONSE_HEAD.as_bytes()).await {
            debug!("Stream {}: failed to send headers: {}", self.peer, e);
            return StreamEnd::IoError;
        }
        self.advance(StreamState::HeadersSent);

        let subscription = match self.hub.add(self.peer).await {
            Ok(sub) => sub,
            Err(HubError::Full(_)) => return StreamEnd::Rejected,
            Err(HubError::Closed) => return StreamEnd::Shutdown,
        };
        self.advance(StreamState::Registered);

        let end = self.live(&subscription).await;

        self.advance(StreamState::Deregistered);
        self.hub.remove(subscription.id).await;
        end
    }

    async fn live(&mut self, subscription: &Subscription) -> StreamEnd {
        // Registered before the first frame, so no broadcast can fall in between
        let snapshot = self.registry.snapshot().await;
        match encode_snapshot_frame(&snapshot) {
            Ok(frame) => {
                if let Err(e) = self.write(frame.as_bytes()).await {
                    debug!("Stream {}: initial snapshot failed: {}", self.peer, e);
                    return StreamEnd::IoError;
                }
            }
            Err(e) => warn!("Stream {}: cannot encode snapshot: {}", self.peer, e),
        }
        self.advance(StreamState::Live);

        let mut probe = [0u8; 64];
        let mut deadline = Instant::now() + self.options.heartbeat;

        loop {
            let wrote = tokio::select! {
                biased;

                _ = self.shutdown.wait() => return StreamEnd::Shutdown,

                frame = subscription.frames.recv() => match frame {
                    Ok(frame) => self.write(frame.as_bytes()).await,
                    Err(_) => return StreamEnd::Dropped,
                },

                read = self.reader.read(&mut probe) => match read {
                    Ok(0) => return StreamEnd::PeerClosed,
                    Ok(n) => {
                        trace!("Stream {}: ignoring {} bytes from peer", self.peer, n);
                        continue;
                    }
                    Err(e) => {
                        debug!("Stream {}: read error: {}", self.peer, e);
                        return StreamEnd::IoError;
                    }
                },

                _ = sleep_until(deadline) => {
                    trace!("Stream {}: heartbeat", self.peer);
                    self.write(HEARTBEAT_FRAME.as_bytes()).await
                }
            };

            if let Err(e) = wrote {
                debug!("Stream {}: write failed: {}", self.peer, e);
                return StreamEnd::IoError;
            }
            deadline = Instant::now() + self.options.heartbeat;
        }
    }

    async fn finish(&mut self) {
        let _ = self.writer.shutdown().await;
        self.advance(StreamState::Closed);
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        write_all_timeout(&mut self.writer, bytes, self.options.write_timeout).await
    }
}
