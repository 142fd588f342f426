//! UDP discovery: announce ourselves once, and open a TCP connection back
//! to every agent we hear announcing itself.
//!
//! The socket is built with socket2 so that `SO_REUSEADDR`,
//! `SO_REUSEPORT` (where available) and `SO_BROADCAST` can be set before
//! binding: every agent on a host shares the same bus port.  A bus address
//! with a first octet in 224..=239 is a multicast group and is joined
//! instead of broadcast to.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use ivy_wire::{parse_announce, DEFAULT_TTL, PROTOCOL_VERSION};

use crate::agent::{remove_peer, BusInner};
use crate::handler;

const RECV_BUF: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the shared-port UDP socket for the bus.
pub(crate) fn bind_udp(bus_addr: Ipv4Addr, bus_port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bus_port);
    socket.bind(&SocketAddr::V4(bind_addr).into())?;

    if bus_addr.is_multicast() {
        debug!(group = %bus_addr, "bus address is a multicast group");
        socket.join_multicast_v4(&bus_addr, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(DEFAULT_TTL)?;
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Announce ourselves, then translate every incoming announcement into an
/// outbound TCP connection handled exactly like an inbound accept.
pub(crate) async fn serve(
    inner: Arc<BusInner>,
    socket: UdpSocket,
    bus: (Ipv4Addr, u16),
    listen_port: u16,
    agent_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let announce = ivy_wire::encode_announce(listen_port, &agent_id, &inner.agent_name);
    match socket.send_to(announce.as_bytes(), bus).await {
        Ok(_) => info!(bus_addr = %bus.0, bus_port = bus.1, "announced on the bus"),
        Err(e) => warn!(error = %e, "failed to send the bus announcement"),
    }

    let mut buf = [0u8; RECV_BUF];
    loop {
        let handler_shutdown = shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        let datagram = String::from_utf8_lossy(&buf[..len]).into_owned();
                        handle_datagram(&inner, &datagram, from, listen_port, &agent_id, &handler_shutdown)
                            .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "udp recv error");
                    }
                }
            }
        }
    }
    info!("discovery stopped");
}

async fn handle_datagram(
    inner: &Arc<BusInner>,
    datagram: &str,
    from: SocketAddr,
    listen_port: u16,
    our_agent_id: &str,
    shutdown: &watch::Receiver<bool>,
) {
    debug!(%datagram, %from, "udp datagram");

    let announce = match parse_announce(datagram) {
        Ok(a) => a,
        Err(e) => {
            warn!(%from, error = %e, "invalid discovery datagram");
            return;
        }
    };
    if announce.version != PROTOCOL_VERSION {
        warn!(
            %from,
            got = announce.version,
            expected = PROTOCOL_VERSION,
            "discovery datagram with wrong protocol version"
        );
        return;
    }
    if announce.agent_id == our_agent_id {
        debug!(%from, "ignoring our own announcement");
        return;
    }

    let peer_ip = from.ip();
    let peer = match inner.register_peer(
        peer_ip,
        announce.tcp_port,
        Some(announce.agent_id.clone()),
        Some(announce.agent_name.clone()),
    ) {
        Ok(peer) => peer,
        Err(e) => {
            info!(%from, agent = %announce.agent_name, "discarding announcement: {}", e);
            return;
        }
    };

    let connect = TcpStream::connect((peer_ip, announce.tcp_port));
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => {
            info!(peer = %peer, agent = %announce.agent_name, "connected to announced agent");
            handler::spawn_connection(
                inner.clone(),
                stream,
                Some(peer),
                listen_port,
                shutdown.clone(),
            );
        }
        Ok(Err(e)) => {
            info!(peer = %peer, error = %e, "failed to connect back, ignoring agent");
            remove_peer(inner, &peer, false);
        }
        Err(_) => {
            info!(peer = %peer, "timed out connecting back, ignoring agent");
            remove_peer(inner, &peer, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
