// holepunch-core — UDP NAT-traversal rendezvous
//
// "Can two peers behind NAT exchange datagrams directly,
//  with the server doing nothing but introductions?"
//
// The server keeps a registry of client id → last-seen public endpoint and
// answers REGISTER / QUERY / LIST / HEARTBEAT; once a client learns a peer's
// endpoint it punches a hole and all further traffic bypasses the server.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{ClientConfig, Session, SessionError, SessionEvent, SessionState};
pub use protocol::{
    PeerMessage, Reply, Request, DELIMITER, MAX_DATAGRAM_SIZE, PROBE_PAYLOAD, PUNCH_PAYLOAD,
};
pub use registry::{ClientRecord, Registry};
pub use server::{dispatch, RendezvousServer, ServerConfig, ServerError};
