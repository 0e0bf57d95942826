//! Client session — connectivity probe, registration, hole-punch, chat
//!
//! One UDP socket, one reader: a single receiver task owns all inbound
//! datagrams and demultiplexes them. Server-sourced datagrams that decode as
//! a [`Reply`] feed an internal channel consumed by the synchronous calls
//! (probe, query, list); everything else is surfaced to the caller as a
//! [`SessionEvent`]. This avoids two blocking readers racing on one socket.

use crate::protocol::{PeerMessage, Reply, Request, MAX_DATAGRAM_SIZE};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Client session configuration. All durations are policy constants, not
/// protocol requirements; tune freely.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rendezvous server address
    pub server_addr: SocketAddr,
    /// Receive buffer size
    pub buffer_size: usize,
    /// Per-attempt reply wait; also the receiver loop's stop-flag granularity
    pub recv_timeout: Duration,
    /// Probe retries before declaring the server unreachable
    pub probe_attempts: u32,
    /// Overall bound on the probe+register bootstrap
    pub connect_timeout: Duration,
    /// Cadence of HEARTBEAT refreshes
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    /// Defaults matching the classic tool: 1s receive timeout, 3 probe
    /// attempts, 8s connect bound, 45s heartbeat.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            buffer_size: MAX_DATAGRAM_SIZE,
            recv_timeout: Duration::from_secs(1),
            probe_attempts: 3,
            connect_timeout: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(45),
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket bound, background loops starting
    Bootstrapping,
    /// Connectivity probe in flight
    Probing,
    /// Probe succeeded, REGISTER sent
    Registered,
    /// Accepting commands, no peer connected
    Idle,
    /// QUERY in flight
    AwaitingPeer,
    /// Peer endpoint known, hole punched
    Connected,
    /// Stopped: user exit, fatal socket error, or failed bootstrap
    Terminated,
}

/// Datagrams surfaced to the foreground by the receiver loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer opened (or answered) a hole-punch
    PunchReceived { from: SocketAddr },
    /// Free-form text from a peer
    PeerMessage { from: SocketAddr, text: String },
    /// Server-sourced datagram that is not a recognized reply
    ServerNotice { text: String },
    /// Fatal socket error; the session has moved to `Terminated`
    TransportError { error: String },
}

/// Session error types.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind client socket: {0}")]
    Bind(std::io::Error),
    #[error("socket error: {0}")]
    Io(std::io::Error),
    #[error("server unreachable after {attempts} probe attempts")]
    ServerUnreachable { attempts: u32 },
    #[error("timed out waiting for a server reply")]
    Timeout,
    #[error("no peer connected")]
    NoPeer,
}

/// A live client session.
#[derive(Debug)]
pub struct Session {
    id: String,
    config: ClientConfig,
    socket: Arc<UdpSocket>,
    state: Arc<RwLock<SessionState>>,
    peer_endpoint: Arc<RwLock<Option<SocketAddr>>>,
    running: watch::Sender<bool>,
    replies: Mutex<mpsc::Receiver<Reply>>,
}

impl Session {
    /// Bind an ephemeral local port, start the receiver loop, probe the
    /// server, register `id`, and start the heartbeat loop.
    ///
    /// The receiver starts before any server contact so probe replies are
    /// never lost. Returns only once the server has acknowledged a probe and
    /// REGISTER has been sent, so callers can treat success as "server
    /// ready". Incoming peer traffic is delivered on `events`.
    pub async fn connect(
        id: impl Into<String>,
        config: ClientConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        let socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(SessionError::Bind)?,
        );
        info!(
            "client socket bound to {}",
            socket.local_addr().map_err(SessionError::Io)?
        );

        let state = Arc::new(RwLock::new(SessionState::Bootstrapping));
        let peer_endpoint = Arc::new(RwLock::new(None));
        let (running_tx, running_rx) = watch::channel(true);
        let (reply_tx, reply_rx) = mpsc::channel(32);

        tokio::spawn(receiver_loop(
            Arc::clone(&socket),
            config.clone(),
            events,
            reply_tx,
            Arc::clone(&state),
            running_tx.clone(),
        ));

        let session = Self {
            id,
            config,
            socket,
            state,
            peer_endpoint,
            running: running_tx,
            replies: Mutex::new(reply_rx),
        };

        match timeout(session.config.connect_timeout, session.bootstrap()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.shutdown();
                return Err(e);
            }
            Err(_) => {
                session.shutdown();
                return Err(SessionError::ServerUnreachable {
                    attempts: session.config.probe_attempts,
                });
            }
        }

        tokio::spawn(heartbeat_loop(
            Arc::clone(&session.socket),
            session.id.clone(),
            session.config.clone(),
            running_rx,
        ));

        *session.state.write() = SessionState::Idle;
        Ok(session)
    }

    /// Probe then register.
    async fn bootstrap(&self) -> Result<(), SessionError> {
        *self.state.write() = SessionState::Probing;
        self.probe().await?;

        *self.state.write() = SessionState::Registered;
        self.send_to_server(Request::Register {
            id: self.id.clone(),
        })
        .await?;

        // Advisory: wait briefly for the OK but proceed regardless, the
        // registry upsert does not depend on us seeing the acknowledgment
        let mut replies = self.replies.lock().await;
        if await_reply(&mut replies, |r| *r == Reply::Ok, self.config.recv_timeout)
            .await
            .is_none()
        {
            warn!("no REGISTER acknowledgment within {:?}", self.config.recv_timeout);
        }
        Ok(())
    }

    /// Send the connectivity probe, retrying up to the configured budget.
    /// Any server-sourced reply counts as proof of reachability.
    async fn probe(&self) -> Result<(), SessionError> {
        let attempts = self.config.probe_attempts;
        let mut replies = self.replies.lock().await;

        for attempt in 1..=attempts {
            debug!("probing {} (attempt {attempt}/{attempts})", self.config.server_addr);
            while replies.try_recv().is_ok() {}
            self.send_to_server(Request::Probe).await?;

            if await_reply(&mut replies, |_| true, self.config.recv_timeout)
                .await
                .is_some()
            {
                info!("server {} reachable", self.config.server_addr);
                return Ok(());
            }
            warn!("probe attempt {attempt}/{attempts} timed out");
        }
        Err(SessionError::ServerUnreachable { attempts })
    }

    /// Ask the server for `target`'s endpoint. On success the endpoint is
    /// stored, a PUNCH datagram is fired at it to open the local NAT
    /// mapping, and the session moves to `Connected`. `Ok(None)` means the
    /// server answered NOT_FOUND.
    pub async fn query_peer(&self, target: &str) -> Result<Option<SocketAddr>, SessionError> {
        let prior = self.state();
        *self.state.write() = SessionState::AwaitingPeer;

        let outcome = self
            .round_trip(
                Request::Query {
                    target: target.to_string(),
                },
                |r| matches!(r, Reply::Addr(_) | Reply::NotFound),
            )
            .await;

        match outcome {
            // The peer endpoint is committed only once the punch has left
            // the socket; a failed send restores the prior state instead
            Ok(Some(Reply::Addr(endpoint))) => match self
                .socket
                .send_to(&PeerMessage::Punch.to_bytes(), endpoint)
                .await
            {
                Ok(_) => {
                    *self.peer_endpoint.write() = Some(endpoint);
                    *self.state.write() = SessionState::Connected;
                    info!("hole-punch sent to {endpoint}");
                    Ok(Some(endpoint))
                }
                Err(e) => {
                    self.restore(prior);
                    Err(SessionError::Io(e))
                }
            },
            // The filter admits nothing but Addr and NotFound
            Ok(Some(_)) => {
                self.restore(prior);
                Ok(None)
            }
            Ok(None) => {
                self.restore(prior);
                Err(SessionError::Timeout)
            }
            Err(e) => {
                self.restore(prior);
                Err(e)
            }
        }
    }

    /// Fetch the online-peer snapshot (this session's id excluded).
    pub async fn list_peers(&self) -> Result<Vec<String>, SessionError> {
        match self
            .round_trip(
                Request::List {
                    requester: self.id.clone(),
                },
                |r| matches!(r, Reply::List { .. }),
            )
            .await?
        {
            Some(Reply::List { ids }) => Ok(ids),
            _ => Err(SessionError::Timeout),
        }
    }

    /// Fire-and-forget chat text to the connected peer. Returns the peer
    /// endpoint the datagram was sent to.
    pub async fn send_chat(&self, text: &str) -> Result<SocketAddr, SessionError> {
        let endpoint = (*self.peer_endpoint.read()).ok_or(SessionError::NoPeer)?;
        self.socket
            .send_to(&PeerMessage::Chat(text.to_string()).to_bytes(), endpoint)
            .await
            .map_err(SessionError::Io)?;
        Ok(endpoint)
    }

    /// Stop all background loops. Each observes the flag within one receive
    /// timeout. Idempotent.
    pub fn shutdown(&self) {
        if self.running.send_replace(false) {
            info!("session {} shutting down", self.id);
        }
        *self.state.write() = SessionState::Terminated;
    }

    /// One request/reply exchange with the server. Stale replies queued by
    /// earlier exchanges (heartbeat ALIVEs, late OKs) are discarded first
    /// and skipped while waiting. `Ok(None)` is a timeout.
    async fn round_trip<F>(&self, request: Request, want: F) -> Result<Option<Reply>, SessionError>
    where
        F: Fn(&Reply) -> bool,
    {
        let mut replies = self.replies.lock().await;
        while replies.try_recv().is_ok() {}
        self.send_to_server(request).await?;
        Ok(await_reply(&mut replies, want, self.config.recv_timeout).await)
    }

    async fn send_to_server(&self, request: Request) -> Result<(), SessionError> {
        self.socket
            .send_to(&request.to_bytes(), self.config.server_addr)
            .await
            .map_err(SessionError::Io)?;
        Ok(())
    }

    fn restore(&self, prior: SessionState) {
        *self.state.write() = if prior == SessionState::Connected {
            SessionState::Connected
        } else {
            SessionState::Idle
        };
    }

    /// This session's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// The connected peer's endpoint, if any.
    pub fn peer_endpoint(&self) -> Option<SocketAddr> {
        *self.peer_endpoint.read()
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        self.socket.local_addr().map_err(SessionError::Io)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.running.send_replace(false);
    }
}

/// The single socket reader. Polls the stop flag once per receive-timeout
/// tick; on a fatal socket error it terminates the session, flips the stop
/// flag so the other loops halt too, and reports once.
async fn receiver_loop(
    socket: Arc<UdpSocket>,
    config: ClientConfig,
    events: mpsc::Sender<SessionEvent>,
    replies: mpsc::Sender<Reply>,
    state: Arc<RwLock<SessionState>>,
    running: watch::Sender<bool>,
) {
    let server = config.server_addr;
    let mut buf = vec![0u8; config.buffer_size];

    while *running.borrow() {
        let (len, src) = match timeout(config.recv_timeout, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                error!("socket error, terminating session: {e}");
                *state.write() = SessionState::Terminated;
                running.send_replace(false);
                let _ = events
                    .send(SessionEvent::TransportError {
                        error: e.to_string(),
                    })
                    .await;
                break;
            }
            Ok(Ok(pair)) => pair,
        };
        let payload = &buf[..len];

        if src == server {
            if let Some(reply) = Reply::from_bytes(payload) {
                if replies.try_send(reply).is_err() {
                    debug!("reply channel full, dropping server reply");
                }
            } else {
                let _ = events
                    .send(SessionEvent::ServerNotice {
                        text: String::from_utf8_lossy(payload).into_owned(),
                    })
                    .await;
            }
            continue;
        }

        match PeerMessage::from_bytes(payload) {
            PeerMessage::Punch => {
                debug!("hole-punch trigger from {src}");
                let _ = events.send(SessionEvent::PunchReceived { from: src }).await;
            }
            PeerMessage::Chat(text) => {
                let _ = events
                    .send(SessionEvent::PeerMessage { from: src, text })
                    .await;
            }
        }
    }
    debug!("receiver loop stopped");
}

/// Periodic HEARTBEAT refresh, independent of session state. Keeps the
/// registry's record of this client's endpoint fresh.
async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    id: String,
    config: ClientConfig,
    mut running: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(config.heartbeat_interval);
    // First interval tick fires immediately; REGISTER just refreshed us
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let request = Request::Heartbeat { id: id.clone() };
                if let Err(e) = socket.send_to(&request.to_bytes(), config.server_addr).await {
                    warn!("heartbeat send failed: {e}");
                }
            }
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
        }
    }
    debug!("heartbeat loop stopped");
}

/// Wait up to `wait` for a reply matching `want`, skipping strays.
async fn await_reply<F>(
    replies: &mut mpsc::Receiver<Reply>,
    want: F,
    wait: Duration,
) -> Option<Reply>
where
    F: Fn(&Reply) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match timeout(remaining, replies.recv()).await {
            Ok(Some(reply)) if want(&reply) => return Some(reply),
            Ok(Some(stray)) => {
                debug!("skipping stray reply {stray:?}");
            }
            Ok(None) => return None,
            Err(_) => return None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
