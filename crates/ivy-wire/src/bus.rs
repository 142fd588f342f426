//! Bus address syntax and UDP discovery datagrams.
//!
//! A bus is written `"A.B.C:port"` or `"A.B.C.D:port"`; missing octets are
//! filled with 255 so that `"127:2010"` names the broadcast address
//! `127.255.255.255:2010`.  A first octet in 224..=239 makes the bus a
//! multicast group instead of a broadcast domain.

use std::net::Ipv4Addr;

use crate::{DEFAULT_BUS, PROTOCOL_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus address {0:?}: {1}")]
    InvalidBus(String, String),
    #[error("malformed discovery datagram: {0}")]
    MalformedAnnounce(String),
}

// ---------------------------------------------------------------------------
// Bus address
// ---------------------------------------------------------------------------

/// Resolve a bus string into `(address, port)`.
///
/// `None` or an empty string falls back to the `IVYBUS` environment
/// variable, then to [`DEFAULT_BUS`].
pub fn decode_bus(bus: Option<&str>) -> Result<(Ipv4Addr, u16), BusError> {
    let supplied = match bus {
        Some(b) if !b.is_empty() => b.to_owned(),
        _ => std::env::var("IVYBUS").unwrap_or_else(|_| DEFAULT_BUS.to_owned()),
    };

    let invalid = |why: &str| BusError::InvalidBus(supplied.clone(), why.to_owned());

    let (addr_part, port_part) = supplied
        .split_once(':')
        .ok_or_else(|| invalid("missing port (expected ADDR:PORT)"))?;
    let port: u16 = port_part
        .parse()
        .map_err(|_| invalid("port is not an integer"))?;

    let addr_part = addr_part.trim_matches('.');
    let octet_strs: Vec<&str> = addr_part.split('.').collect();
    if octet_strs.is_empty() || octet_strs.len() > 4 {
        return Err(invalid("expected 1 to 4 octets"));
    }

    let mut octets = [255u8; 4];
    for (i, s) in octet_strs.iter().enumerate() {
        octets[i] = s.parse().map_err(|_| invalid("octet is not in 0-255"))?;
    }

    Ok((Ipv4Addr::from(octets), port))
}

// ---------------------------------------------------------------------------
// Discovery datagram
// ---------------------------------------------------------------------------

/// A parsed discovery announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub version: u32,
    pub tcp_port: u16,
    pub agent_id: String,
    pub agent_name: String,
}

/// Encode the startup announcement sent to the bus address.
pub fn encode_announce(tcp_port: u16, agent_id: &str, agent_name: &str) -> String {
    format!(
        "{} {} {} {}\n",
        PROTOCOL_VERSION, tcp_port, agent_id, agent_name
    )
}

/// Parse a discovery datagram: `"<version> <tcp_port> <agent_id> <name>\n"`.
///
/// The agent name is everything after the third space (names may contain
/// spaces); the trailing newline is stripped.  The protocol version is
/// returned as-is — rejecting a mismatch is the receive loop's call.
pub fn parse_announce(datagram: &str) -> Result<Announce, BusError> {
    let mut fields = datagram.splitn(4, ' ');
    let (version_str, port_str, agent_id, name_rest) = match (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) {
        (Some(v), Some(p), Some(id), Some(name)) => (v, p, id, name),
        _ => {
            return Err(BusError::MalformedAnnounce(format!(
                "expected 4 fields in {:?}",
                datagram
            )))
        }
    };

    let version: u32 = version_str.parse().map_err(|_| {
        BusError::MalformedAnnounce(format!("bad protocol version {:?}", version_str))
    })?;
    let tcp_port: u16 = port_str
        .parse()
        .map_err(|_| BusError::MalformedAnnounce(format!("bad tcp port {:?}", port_str)))?;

    Ok(Announce {
        version,
        tcp_port,
        agent_id: agent_id.to_owned(),
        agent_name: name_rest.trim_end_matches('\n').to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
