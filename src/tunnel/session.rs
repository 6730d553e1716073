//! One registered agent tunnel.
//!
//! A [`TunnelSession`] owns the TCP connection to its agent. The connection
//! mutex is the whole concurrency story: exactly one request may be in flight
//! per session, and only the task holding the mutex touches the socket — the
//! response to a request is read by the same call that wrote it. There is no
//! separate reader task, so between dispatches the socket is idle with no
//! pending read; dead agents are found by the heartbeat sweep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::codec::{self, Frame};
use super::{TunnelError, TunnelRequest, TunnelResponse, HEARTBEAT_OK};
use crate::util::format_uptime;

/// The two halves of an agent connection, always accessed together under the
/// session's mutex.
pub struct FramedConn {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl FramedConn {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }
}

/// Gateway-side representation of one agent tunnel.
pub struct TunnelSession {
    /// Agent name; fixed at registration.
    name: String,
    remote_ip: String,
    local_addr: SocketAddr,
    connected_at: Instant,
    connected_at_wall: DateTime<Local>,
    /// Set on any dispatch failure or explicit close. Once set, the session
    /// never carries another request; the registry removes it on the next
    /// touch.
    closed: AtomicBool,
    max_frame_bytes: usize,
    /// The request mutex: serializes entire write-request/read-response
    /// spans. Heartbeats queue here like any other dispatch.
    conn: Mutex<FramedConn>,
}

impl TunnelSession {
    /// Wrap an authenticated, named connection. Called by the listener after
    /// the handshake produced a non-empty name.
    pub fn new(
        name: String,
        remote_ip: String,
        local_addr: SocketAddr,
        conn: FramedConn,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            name,
            remote_ip,
            local_addr,
            connected_at: Instant::now(),
            connected_at_wall: Local::now(),
            closed: AtomicBool::new(false),
            max_frame_bytes,
            conn: Mutex::new(conn),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local time when the agent registered, ISO-8601.
    pub fn connected_at(&self) -> String {
        self.connected_at_wall
            .format("%Y-%m-%dT%H:%M:%S%.3f")
            .to_string()
    }

    /// Time since registration in the coarsest unit ≥ 1, e.g.
    /// `"2 hours, 13 minutes"`.
    pub fn uptime(&self) -> String {
        format_uptime(self.connected_at.elapsed())
    }

    /// Cheap local health check: not closed, not mid-teardown. Performs no
    /// I/O and never writes probe bytes into the framed stream — liveness
    /// beyond this goes through [`Self::heartbeat`].
    pub fn socket_healthy(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Mark the session closed and shut down the write half so the agent
    /// observes EOF. If a dispatch is in flight the socket shutdown is
    /// skipped; the holder will fail its read or find the flag afterwards.
    pub async fn close(&self) {
        self.mark_closed();
        if let Ok(mut conn) = self.conn.try_lock() {
            let _ = conn.writer.shutdown().await;
        }
    }

    /// Send a request down the tunnel and await the paired response.
    ///
    /// Queues on the connection mutex behind any in-flight exchange. The
    /// deadline applies to the response read, not to the queue wait. Every
    /// failure marks the session closed: a timed-out or half-written
    /// exchange leaves the stream unsynchronized, so nothing may reuse it.
    pub async fn dispatch(
        &self,
        request: &TunnelRequest,
        deadline: Duration,
    ) -> Result<TunnelResponse, TunnelError> {
        if !self.socket_healthy() {
            return Err(TunnelError::Closed);
        }

        let mut conn = self.conn.lock().await;

        // Re-check under the mutex: a concurrent dispatch may have failed
        // while this one was queued.
        if !self.socket_healthy() {
            return Err(TunnelError::Closed);
        }

        debug!(
            client = %self.name,
            method = %request.method,
            url = %request.url,
            "Dispatching request over tunnel"
        );

        if let Err(e) = codec::write_frame(&mut conn.writer, &Frame::Request(request.clone())).await
        {
            self.mark_closed();
            return Err(e);
        }

        let frame = match timeout(
            deadline,
            codec::read_frame(&mut conn.reader, self.max_frame_bytes),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.mark_closed();
                return Err(e);
            }
            Err(_) => {
                // Deadline passed with the response unread. The stream is now
                // out of sync (the reply may still arrive later), so the
                // session is done — but the socket itself is left to the
                // registry's cleanup.
                warn!(client = %self.name, "Dispatch timed out awaiting response");
                self.mark_closed();
                return Err(TunnelError::Timeout);
            }
        };

        match frame {
            Frame::Response(response) => Ok(response),
            other => {
                self.mark_closed();
                Err(TunnelError::StreamCorrupt(format!(
                    "expected response frame, got {other:?}"
                )))
            }
        }
    }

    /// Probe the agent with an in-band heartbeat. Takes the connection mutex
    /// like any dispatch, so a probe never interleaves with a forward.
    pub async fn heartbeat(&self, deadline: Duration) -> Result<(), TunnelError> {
        let request = TunnelRequest::heartbeat(&self.name);
        let response = self.dispatch(&request, deadline).await?;
        if response.status == 200 && response.body == HEARTBEAT_OK {
            Ok(())
        } else {
            self.mark_closed();
            Err(TunnelError::StreamCorrupt(format!(
                "unexpected heartbeat reply: status {}",
                response.status
            )))
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("name", &self.name)
            .field("remote_ip", &self.remote_ip)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
