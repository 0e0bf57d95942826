//! Rendezvous wire protocol — pipe-delimited ASCII over single UDP datagrams
//!
//! The first field of every datagram is the message tag. The `LIST` tag is a
//! request when the server decodes it and a reply when the client decodes it,
//! so the catalog is split by direction into three enums.

use std::net::{IpAddr, SocketAddr};

/// Field delimiter within a datagram.
pub const DELIMITER: char = '|';

/// Connectivity-probe payload. Distinguished literal, not pipe-delimited.
pub const PROBE_PAYLOAD: &str = "TEST_CONNECTION";

/// Hole-punch trigger payload. No reply is expected.
pub const PUNCH_PAYLOAD: &str = "PUNCH";

/// Maximum UDP payload this protocol will read or write.
/// Oversize inbound datagrams are truncated by the read buffer, never an error.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// A client-to-server request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register (or refresh) this id at the sender's source address
    Register { id: String },
    /// Ask for the target's current endpoint
    Query { target: String },
    /// Ask for all other registered ids
    List { requester: String },
    /// Liveness refresh; only acknowledged if the id is already registered
    Heartbeat { id: String },
    /// Connectivity check sent before registering
    Probe,
}

/// A server-to-client reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Registration (or probe) acknowledged
    Ok,
    /// The queried peer's known endpoint
    Addr(SocketAddr),
    /// The queried id has no registry entry
    NotFound,
    /// Online-peer snapshot, requester excluded
    List { ids: Vec<String> },
    /// Heartbeat acknowledged
    Alive,
}

/// A datagram exchanged directly between peers, bypassing the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Hole-punch trigger
    Punch,
    /// Free-form chat text (any payload not matching a known tag)
    Chat(String),
}

impl Request {
    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Request::Register { id } => format!("REGISTER{DELIMITER}{id}").into_bytes(),
            Request::Query { target } => format!("QUERY{DELIMITER}{target}").into_bytes(),
            Request::List { requester } => format!("LIST{DELIMITER}{requester}").into_bytes(),
            Request::Heartbeat { id } => format!("HEARTBEAT{DELIMITER}{id}").into_bytes(),
            Request::Probe => PROBE_PAYLOAD.as_bytes().to_vec(),
        }
    }

    /// Decode from wire bytes. Returns `None` for unrecognized tags, missing
    /// or empty id fields, and non-UTF-8 payloads — malformed datagrams are
    /// dropped silently at this boundary.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;

        if text == PROBE_PAYLOAD {
            return Some(Request::Probe);
        }

        let mut fields = text.split(DELIMITER);
        let tag = fields.next()?;
        match tag {
            "REGISTER" => Some(Request::Register {
                id: non_empty(fields.next()?)?,
            }),
            "QUERY" => Some(Request::Query {
                target: non_empty(fields.next()?)?,
            }),
            "LIST" => Some(Request::List {
                requester: non_empty(fields.next()?)?,
            }),
            "HEARTBEAT" => Some(Request::Heartbeat {
                id: non_empty(fields.next()?)?,
            }),
            _ => None,
        }
    }

    /// Human-readable tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Request::Register { .. } => "REGISTER",
            Request::Query { .. } => "QUERY",
            Request::List { .. } => "LIST",
            Request::Heartbeat { .. } => "HEARTBEAT",
            Request::Probe => PROBE_PAYLOAD,
        }
    }
}

impl Reply {
    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"OK".to_vec(),
            Reply::Addr(addr) => {
                format!("ADDR{DELIMITER}{}{DELIMITER}{}", addr.ip(), addr.port()).into_bytes()
            }
            Reply::NotFound => b"NOT_FOUND".to_vec(),
            Reply::List { ids } => format!("LIST{DELIMITER}{}", ids.join(",")).into_bytes(),
            Reply::Alive => b"ALIVE".to_vec(),
        }
    }

    /// Decode from wire bytes, same silent-drop policy as [`Request::from_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut fields = text.split(DELIMITER);
        match fields.next()? {
            "OK" => Some(Reply::Ok),
            "ADDR" => {
                let ip: IpAddr = fields.next()?.parse().ok()?;
                let port: u16 = fields.next()?.parse().ok()?;
                Some(Reply::Addr(SocketAddr::new(ip, port)))
            }
            "NOT_FOUND" => Some(Reply::NotFound),
            "LIST" => {
                let ids = fields
                    .next()?
                    .split(',')
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect();
                Some(Reply::List { ids })
            }
            "ALIVE" => Some(Reply::Alive),
            _ => None,
        }
    }
}

impl PeerMessage {
    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PeerMessage::Punch => PUNCH_PAYLOAD.as_bytes().to_vec(),
            PeerMessage::Chat(text) => text.as_bytes().to_vec(),
        }
    }

    /// Decode from wire bytes. Never fails: anything that is not a punch
    /// trigger is treated as chat text.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes == PUNCH_PAYLOAD.as_bytes() {
            PeerMessage::Punch
        } else {
            PeerMessage::Chat(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_form() {
        let req = Request::Register {
            id: "alice".to_string(),
        };
        assert_eq!(req.to_bytes(), b"REGISTER|alice");
        assert_eq!(Request::from_bytes(b"REGISTER|alice"), Some(req));
    }

    #[test]
    fn test_query_wire_form() {
        let req = Request::Query {
            target: "bob".to_string(),
        };
        assert_eq!(req.to_bytes(), b"QUERY|bob");
        assert_eq!(Request::from_bytes(b"QUERY|bob"), Some(req));
    }

    #[test]
    fn test_heartbeat_wire_form() {
        let req = Request::Heartbeat {
            id: "alice".to_string(),
        };
        assert_eq!(req.to_bytes(), b"HEARTBEAT|alice");
        assert_eq!(Request::from_bytes(b"HEARTBEAT|alice"), Some(req));
    }

    #[test]
    fn test_probe_is_not_pipe_delimited() {
        assert_eq!(Request::Probe.to_bytes(), b"TEST_CONNECTION");
        assert_eq!(
            Request::from_bytes(b"TEST_CONNECTION"),
            Some(Request::Probe)
        );
    }

    #[test]
    fn test_unknown_tag_is_dropped() {
        assert_eq!(Request::from_bytes(b"GARBAGE|x|y"), None);
        assert_eq!(Reply::from_bytes(b"GARBAGE|x|y"), None);
    }

    #[test]
    fn test_missing_field_is_dropped() {
        assert_eq!(Request::from_bytes(b"REGISTER"), None);
        assert_eq!(Request::from_bytes(b"QUERY"), None);
        assert_eq!(Request::from_bytes(b"HEARTBEAT"), None);
    }

    #[test]
    fn test_empty_id_field_is_dropped() {
        assert_eq!(Request::from_bytes(b"REGISTER|"), None);
        assert_eq!(Request::from_bytes(b"LIST|"), None);
    }

    #[test]
    fn test_non_utf8_is_dropped() {
        assert_eq!(Request::from_bytes(&[0xff, 0xfe, b'|', b'x']), None);
        assert_eq!(Reply::from_bytes(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_addr_reply_roundtrip() {
        let addr: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let reply = Reply::Addr(addr);
        assert_eq!(reply.to_bytes(), b"ADDR|203.0.113.7|40123");
        assert_eq!(Reply::from_bytes(b"ADDR|203.0.113.7|40123"), Some(reply));
    }

    #[test]
    fn test_addr_reply_bad_port_is_dropped() {
        assert_eq!(Reply::from_bytes(b"ADDR|203.0.113.7|notaport"), None);
        assert_eq!(Reply::from_bytes(b"ADDR|203.0.113.7"), None);
        assert_eq!(Reply::from_bytes(b"ADDR|nothost|1234"), None);
    }

    #[test]
    fn test_list_reply_joins_with_commas() {
        let reply = Reply::List {
            ids: vec!["bob".to_string(), "carol".to_string()],
        };
        assert_eq!(reply.to_bytes(), b"LIST|bob,carol");
        assert_eq!(Reply::from_bytes(b"LIST|bob,carol"), Some(reply));
    }

    #[test]
    fn test_empty_list_reply() {
        let reply = Reply::List { ids: vec![] };
        assert_eq!(reply.to_bytes(), b"LIST|");
        // Decoding filters the empty field back out
        assert_eq!(Reply::from_bytes(b"LIST|"), Some(Reply::List { ids: vec![] }));
    }

    #[test]
    fn test_bare_replies() {
        assert_eq!(Reply::Ok.to_bytes(), b"OK");
        assert_eq!(Reply::from_bytes(b"OK"), Some(Reply::Ok));
        assert_eq!(Reply::from_bytes(b"NOT_FOUND"), Some(Reply::NotFound));
        assert_eq!(Reply::from_bytes(b"ALIVE"), Some(Reply::Alive));
    }

    #[test]
    fn test_punch_trigger() {
        assert_eq!(PeerMessage::Punch.to_bytes(), b"PUNCH");
        assert_eq!(PeerMessage::from_bytes(b"PUNCH"), PeerMessage::Punch);
    }

    #[test]
    fn test_free_text_is_chat() {
        assert_eq!(
            PeerMessage::from_bytes(b"hello there"),
            PeerMessage::Chat("hello there".to_string())
        );
        // Unknown tags between peers are chat too, not an error
        assert_eq!(
            PeerMessage::from_bytes(b"GARBAGE|x"),
            PeerMessage::Chat("GARBAGE|x".to_string())
        );
    }
}
