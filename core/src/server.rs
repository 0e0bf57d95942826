//! Rendezvous server — one-shot RPC over UDP
//!
//! No per-connection sessions: every inbound datagram is handled by its own
//! spawned task, produces at most one reply, and the reply always goes back
//! to the datagram's source address. The registry is the only state shared
//! across requests.

use crate::protocol::{Reply, Request, MAX_DATAGRAM_SIZE};
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to
    pub bind_addr: SocketAddr,
    /// Receive buffer size; larger payloads are truncated by the transport
    pub buffer_size: usize,
    /// Evict records not refreshed within this window. `None` (the default)
    /// keeps entries immortal, matching the classic behavior.
    pub stale_after: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            buffer_size: MAX_DATAGRAM_SIZE,
            stale_after: None,
        }
    }
}

/// Server error types. Both variants are fatal: malformed datagrams never
/// reach this level, only socket-level OS failures do.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// The rendezvous server: owns the socket and the registry.
pub struct RendezvousServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    socket: Arc<UdpSocket>,
}

impl RendezvousServer {
    /// Bind the UDP socket. Bind failure is fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        info!("rendezvous server listening on {}", socket.local_addr()?);

        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            socket: Arc::new(socket),
        })
    }

    /// The actually-bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared handle to the registry.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Receive loop. Spawns one handling task per datagram; returns only on
    /// a fatal socket error.
    pub async fn run(self) -> Result<(), ServerError> {
        if let Some(max_age) = self.config.stale_after {
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(max_age.max(Duration::from_secs(1)));
                loop {
                    tick.tick().await;
                    let evicted = registry.evict_stale(max_age);
                    if evicted > 0 {
                        info!("evicted {evicted} stale registry entries");
                    }
                }
            });
        }

        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let payload = buf[..len].to_vec();
            let registry = Arc::clone(&self.registry);
            let socket = Arc::clone(&self.socket);

            tokio::spawn(async move {
                if let Some(reply) = dispatch(&registry, &payload, src) {
                    if let Err(e) = socket.send_to(&reply, src).await {
                        warn!("failed to reply to {src}: {e}");
                    }
                }
            });
        }
    }
}

/// Handle a single datagram: decode, mutate/read the registry, and produce
/// at most one reply destined for `src`. Undecodable payloads are a no-op.
pub fn dispatch(registry: &Registry, payload: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
    let request = match Request::from_bytes(payload) {
        Some(request) => request,
        None => {
            debug!("dropping malformed datagram from {src} ({} bytes)", payload.len());
            return None;
        }
    };

    debug!("{} from {src}", request.tag());
    match request {
        Request::Register { id } => {
            registry.register(&id, src);
            info!("client {id} registered from {src}");
            Some(Reply::Ok.to_bytes())
        }
        Request::Query { target } => match registry.endpoint_of(&target) {
            Some(endpoint) => Some(Reply::Addr(endpoint).to_bytes()),
            None => Some(Reply::NotFound.to_bytes()),
        },
        Request::List { requester } => {
            let ids = registry.peers_excluding(&requester);
            Some(Reply::List { ids }.to_bytes())
        }
        Request::Heartbeat { id } => {
            // Unknown ids get no reply, distinguishing "unknown" from "refreshed"
            if registry.heartbeat(&id, src) {
                Some(Reply::Alive.to_bytes())
            } else {
                debug!("heartbeat from unregistered id {id} at {src}");
                None
            }
        }
        // Acknowledge the connectivity probe so the client's ready gate fires
        Request::Probe => Some(Reply::Ok.to_bytes()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn src(port: u16) -> SocketAddr {
        format!("198.51.100.4:{port}").parse().unwrap()
    }

    #[test]
    fn test_register_replies_ok_and_records_source() {
        let registry = Registry::new();
        let reply = dispatch(&registry, b"REGISTER|alice", src(7000));

        assert_eq!(reply, Some(b"OK".to_vec()));
        assert_eq!(registry.endpoint_of("alice"), Some(src(7000)));
    }

    #[test]
    fn test_query_known_id_replies_addr() {
        let registry = Registry::new();
        dispatch(&registry, b"REGISTER|alice", src(7000));

        let reply = dispatch(&registry, b"QUERY|alice", src(8000));
        assert_eq!(reply, Some(b"ADDR|198.51.100.4|7000".to_vec()));
    }

    #[test]
    fn test_query_unknown_id_replies_not_found() {
        let registry = Registry::new();
        let reply = dispatch(&registry, b"QUERY|nobody", src(8000));
        assert_eq!(reply, Some(b"NOT_FOUND".to_vec()));
    }

    #[test]
    fn test_list_excludes_requester() {
        let registry = Registry::new();
        dispatch(&registry, b"REGISTER|alice", src(1));
        dispatch(&registry, b"REGISTER|bob", src(2));

        let reply = dispatch(&registry, b"LIST|alice", src(1)).unwrap();
        assert_eq!(reply, b"LIST|bob".to_vec());
    }

    #[test]
    fn test_heartbeat_registered_replies_alive_and_refreshes() {
        let registry = Registry::new();
        dispatch(&registry, b"REGISTER|alice", src(7000));

        // Heartbeat arrives from a rebound NAT port
        let reply = dispatch(&registry, b"HEARTBEAT|alice", src(7001));
        assert_eq!(reply, Some(b"ALIVE".to_vec()));
        assert_eq!(registry.endpoint_of("alice"), Some(src(7001)));
    }

    #[test]
    fn test_heartbeat_unregistered_is_silent() {
        let registry = Registry::new();
        let reply = dispatch(&registry, b"HEARTBEAT|ghost", src(7000));

        assert_eq!(reply, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_probe_is_acknowledged() {
        let registry = Registry::new();
        let reply = dispatch(&registry, b"TEST_CONNECTION", src(7000));

        assert_eq!(reply, Some(b"OK".to_vec()));
        // A probe is not a registration
        assert!(registry.is_empty());
    }

    #[test]
    fn test_garbage_is_dropped_without_side_effects() {
        let registry = Registry::new();
        dispatch(&registry, b"REGISTER|alice", src(7000));

        let reply = dispatch(&registry, b"GARBAGE|x|y", src(8000));
        assert_eq!(reply, None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.endpoint_of("alice"), Some(src(7000)));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = RendezvousServer::bind(config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let first = RendezvousServer::bind(config.clone()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let conflicting = ServerConfig {
            bind_addr: taken,
            ..Default::default()
        };
        let result = RendezvousServer::bind(conflicting).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }
}
