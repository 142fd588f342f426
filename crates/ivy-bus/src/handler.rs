//! Per-connection handler: the handshake we owe every new connection, the
//! framed read loop, and the dispatch table for received frames.
//!
//! Inbound and outbound connections share one handler.  An outbound
//! connection arrives with its peer record already registered by the
//! discovery loop; an inbound one is registered only once its `START_INIT`
//! tells us which listening port (and therefore which logical agent) is
//! calling, so both directions key the directory the same way and one
//! remote agent can never yield two records.
//!
//! "Close this connection" and "illegal frame for this state" are ordinary
//! return values ([`FrameOutcome`]), not errors; only transport failures
//! surface as `io::Error` from the read loop.

use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use ivy_wire::{decode, encode_raw, Frame, MsgType};

use crate::agent::{remove_peer, shutdown, track_task, BusInner};
use crate::callbacks::{run_callback, ApplicationEvent, DieAction, RegexpEvent};
use crate::peer::{run_writer, Peer, PeerStatus};

/// What to do with the connection after one frame.
enum FrameOutcome {
    Continue,
    /// Orderly close (BYE).
    Close,
    /// Protocol violation; close and say why.
    Fatal(String),
}

/// Spawn the handler (and its writer sidekick) for one established
/// connection.  `origin` is the pre-registered record for an outbound
/// connection, `None` for an inbound accept.
pub(crate) fn spawn_connection(
    inner: Arc<BusInner>,
    stream: TcpStream,
    origin: Option<Arc<Peer>>,
    listen_port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let handle = tokio::spawn(run_connection(inner.clone(), stream, origin, listen_port, shutdown));
    track_task(&inner, handle);
}

async fn run_connection(
    inner: Arc<BusInner>,
    stream: TcpStream,
    origin: Option<Arc<Peer>>,
    listen_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote_ip = match stream.peer_addr() {
        Ok(addr) => addr.ip(),
        Err(e) => {
            debug!(error = %e, "connection lost before the handshake");
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf: Vec<u8> = Vec::new();

    let peer = match origin {
        Some(peer) => {
            // Our outbound connection.  The record can lose a
            // duplicate-connection race between registration and here.
            if !still_registered(&inner, &peer) {
                debug!(peer = %peer, "outbound connection superseded, dropping it");
                return;
            }
            let Some(outbox_rx) = peer.take_outbox_rx() else {
                warn!(peer = %peer, "connection for a peer that already has a handler");
                return;
            };
            peer.enqueue_raw(handshake_bytes(&inner, listen_port));
            track_task(
                &inner,
                tokio::spawn(run_writer(write_half, outbox_rx, peer.to_string())),
            );
            peer
        }
        None => {
            // Inbound: greet immediately, then wait for START_INIT to learn
            // who is calling before registering anything.
            if let Err(e) = write_half.write_all(&handshake_bytes(&inner, listen_port)).await {
                info!(%remote_ip, error = %e, "[ignored] error on socket send");
                return;
            }
            let resolved =
                await_start_init(&inner, &mut reader, &mut buf, remote_ip, listen_port, &mut shutdown)
                    .await;
            let Some(peer) = resolved else {
                return;
            };
            let Some(outbox_rx) = peer.take_outbox_rx() else {
                warn!(peer = %peer, "connection for a peer that already has a handler");
                return;
            };
            track_task(
                &inner,
                tokio::spawn(run_writer(write_half, outbox_rx, peer.to_string())),
            );
            peer
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => {
                        info!(peer = %peer, "lost connection");
                        remove_peer(&inner, &peer, true);
                        break;
                    }
                    Ok(_) => {
                        if buf.last() != Some(&b'\n') {
                            // EOF mid-frame; the next read reports it.
                            continue;
                        }
                        buf.pop();
                        let line = match String::from_utf8(std::mem::take(&mut buf)) {
                            Ok(line) => line,
                            Err(_) => {
                                warn!(peer = %peer, "received a non-UTF-8 frame");
                                continue;
                            }
                        };
                        match process_line(&inner, &peer, &line) {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Close => {
                                info!(peer = %peer, "waves bye-bye: disconnecting");
                                remove_peer(&inner, &peer, true);
                                break;
                            }
                            FrameOutcome::Fatal(why) => {
                                warn!(peer = %peer, why = %why, "protocol error: disconnecting");
                                remove_peer(&inner, &peer, true);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        info!(peer = %peer, error = %e, "error on socket recv");
                        remove_peer(&inner, &peer, true);
                        break;
                    }
                }
            }
        }
    }
    debug!(peer = %peer, "connection handler closed");
}

/// Whether `peer` is still the record registered under its address.
fn still_registered(inner: &Arc<BusInner>, peer: &Arc<Peer>) -> bool {
    let state = inner.state.lock().unwrap();
    state
        .peers
        .get(&peer.addr())
        .map_or(false, |current| Arc::ptr_eq(current, peer))
}

/// The three-part greeting every connection starts with: who we are, what
/// we subscribe to, and that we are done.
fn handshake_bytes(inner: &Arc<BusInner>, listen_port: u16) -> Vec<u8> {
    let subscriptions = { inner.state.lock().unwrap().registry.subscriptions() };

    let mut bytes = encode_raw(MsgType::StartInit, i64::from(listen_port), &inner.agent_name);
    for (id, regexp) in subscriptions {
        bytes.extend_from_slice(&encode_raw(MsgType::AddRegexp, i64::from(id), &regexp));
    }
    bytes.extend_from_slice(&encode_raw(MsgType::EndInit, 0, ""));
    bytes
}

/// Read frames on a fresh inbound connection until its `START_INIT`, then
/// resolve the peer record.  `None` means the connection must be dropped
/// (EOF, BYE, a protocol error, or losing the duplicate-connection race).
async fn await_start_init(
    inner: &Arc<BusInner>,
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
    remote_ip: IpAddr,
    listen_port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Arc<Peer>> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                return None;
            }
            read = reader.read_until(b'\n', buf) => {
                match read {
                    Ok(0) => {
                        info!(%remote_ip, "connection closed before START_INIT");
                        return None;
                    }
                    Ok(_) => {
                        if buf.last() != Some(&b'\n') {
                            continue;
                        }
                        buf.pop();
                        let line = match String::from_utf8(std::mem::take(buf)) {
                            Ok(line) => line,
                            Err(_) => {
                                warn!(%remote_ip, "received a non-UTF-8 frame");
                                continue;
                            }
                        };
                        let frame = match decode(&line) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(%remote_ip, line = %line, error = %e,
                                    "received an incorrect message");
                                continue;
                            }
                        };
                        match frame.msg_type {
                            MsgType::Bye => return None,
                            MsgType::StartInit => {
                                let Some(remote_name) = frame.params.first() else {
                                    warn!(%remote_ip,
                                        "START_INIT without an agent name: disconnecting");
                                    return None;
                                };
                                let Ok(announced_port) = u16::try_from(frame.num_id) else {
                                    warn!(%remote_ip, num_id = frame.num_id,
                                        "START_INIT with an invalid port: disconnecting");
                                    return None;
                                };
                                return resolve_inbound(
                                    inner,
                                    remote_ip,
                                    announced_port,
                                    listen_port,
                                    remote_name,
                                );
                            }
                            other => {
                                warn!(%remote_ip, msg_type = %other,
                                    "frame before START_INIT: disconnecting");
                                return None;
                            }
                        }
                    }
                    Err(e) => {
                        info!(%remote_ip, error = %e, "error on socket recv");
                        return None;
                    }
                }
            }
        }
    }
}

/// Register the record for an inbound connection announced as listening on
/// `(ip, announced_port)`.
///
/// When a record already exists under that key, the two agents connected
/// to each other at the same time.  Both ends resolve it with the same
/// rule: the connection initiated by the agent with the smaller listening
/// port survives, so exactly one of the two connections is kept.  A
/// retired record fires *disconnected* iff its *connected* had fired.
fn resolve_inbound(
    inner: &Arc<BusInner>,
    ip: IpAddr,
    announced_port: u16,
    listen_port: u16,
    remote_name: &str,
) -> Option<Arc<Peer>> {
    let (adopted, retired) = {
        let mut state = inner.state.lock().unwrap();
        match state.peers.get(&(ip, announced_port)).cloned() {
            None => {
                let peer = Arc::new(Peer::new(ip, announced_port, None, None));
                state.peers.insert((ip, announced_port), peer.clone());
                (Some(peer), None)
            }
            Some(rival) if listen_port < announced_port => {
                info!(peer = %rival, "duplicate connection, keeping our outbound");
                (None, None)
            }
            Some(rival) => {
                // The inbound side wins; carry the discovery identity over.
                state.registry.unbind_all(&rival);
                let peer = Arc::new(Peer::new(
                    ip,
                    announced_port,
                    rival.agent_id().map(str::to_owned),
                    None,
                ));
                state.peers.insert((ip, announced_port), peer.clone());
                (Some(peer), Some(rival))
            }
        }
    };

    if let Some(rival) = retired {
        info!(peer = %rival, "duplicate connection, adopting the inbound side");
        rival.close_outbox();
        if rival.status() == PeerStatus::Initialized {
            if let Some(cb) = inner.callbacks.app() {
                run_callback("application callback (disconnection)", (), || {
                    cb(&rival, ApplicationEvent::Disconnected);
                });
            }
        }
    }

    let peer = adopted?;
    if let Err(e) = peer.start_init(remote_name) {
        warn!(peer = %peer, error = %e, "fresh record refused START_INIT");
        return None;
    }
    Some(peer)
}

fn process_line(inner: &Arc<BusInner>, peer: &Arc<Peer>, line: &str) -> FrameOutcome {
    let frame = match decode(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(peer = %peer, line, error = %e, "received an incorrect message");
            return FrameOutcome::Continue;
        }
    };
    if frame.missing_arg_end {
        warn!(peer = %peer, "misformatted message: last parameter is not ETX-terminated");
    }
    process_frame(inner, peer, frame)
}

fn process_frame(inner: &Arc<BusInner>, peer: &Arc<Peer>, frame: Frame) -> FrameOutcome {
    debug!(peer = %peer, msg_type = %frame.msg_type, num_id = frame.num_id, "frame");

    match frame.msg_type {
        MsgType::Bye => FrameOutcome::Close,

        MsgType::StartInit => {
            let Some(remote_name) = frame.params.first() else {
                return FrameOutcome::Fatal("START_INIT without an agent name".to_owned());
            };
            if let Err(e) = peer.start_init(remote_name) {
                return FrameOutcome::Fatal(e.to_string());
            }
            info!(agent = %remote_name, peer = %peer, "agent connected");
            FrameOutcome::Continue
        }

        MsgType::EndInit => {
            if let Err(e) = peer.end_init() {
                return FrameOutcome::Fatal(e.to_string());
            }
            if let Some(cb) = inner.callbacks.app() {
                run_callback("application callback (connection)", (), || {
                    cb(peer, ApplicationEvent::Connected);
                });
            }
            // The ready message rides the normal dispatch path: the peer
            // only sees it if one of its subscriptions matches.
            if let Some(ready) = inner.ready_message.as_deref() {
                if !ready.is_empty() {
                    inner.dispatch(ready, Some(peer));
                }
            }
            FrameOutcome::Continue
        }

        MsgType::AddRegexp => {
            let Some(regexp) = frame.params.first() else {
                return FrameOutcome::Fatal("ADD_REGEXP without a pattern".to_owned());
            };
            let appended = {
                inner
                    .state
                    .lock()
                    .unwrap()
                    .registry
                    .try_append(peer, frame.num_id, regexp)
            };
            if !appended {
                // First sight of this pattern: compile it outside the lock.
                match Regex::new(regexp) {
                    Ok(pattern) => {
                        inner
                            .state
                            .lock()
                            .unwrap()
                            .registry
                            .bind(peer, frame.num_id, regexp, pattern);
                    }
                    Err(e) => {
                        warn!(peer = %peer, regexp = %regexp, error = %e, "peer sent an invalid regexp");
                        return FrameOutcome::Continue;
                    }
                }
            }
            fire_regexp_change(inner, peer, RegexpEvent::Added, frame.num_id, regexp);
            FrameOutcome::Continue
        }

        MsgType::DelRegexp => {
            let removed = {
                inner
                    .state
                    .lock()
                    .unwrap()
                    .registry
                    .unbind(peer, frame.num_id)
            };
            match removed {
                Some(regexp) => {
                    fire_regexp_change(inner, peer, RegexpEvent::Removed, frame.num_id, &regexp);
                }
                None => {
                    warn!(peer = %peer, num_id = frame.num_id,
                        "tried to remove a non-registered subscription");
                }
            }
            FrameOutcome::Continue
        }

        MsgType::Msg => {
            handle_msg(inner, peer, &frame);
            FrameOutcome::Continue
        }

        MsgType::DirectMsg => {
            let msg = frame.params.first().cloned().unwrap_or_default();
            info!(peer = %peer, num_id = frame.num_id, %msg, "direct message");
            if let Some(cb) = inner.callbacks.direct() {
                run_callback("direct message callback", (), || {
                    cb(peer, frame.num_id, &msg);
                });
            }
            FrameOutcome::Continue
        }

        MsgType::Error => {
            warn!(peer = %peer, params = ?frame.params, "peer sent a protocol error");
            FrameOutcome::Continue
        }

        MsgType::Ping => {
            peer.send_pong(frame.num_id);
            FrameOutcome::Continue
        }

        MsgType::Pong => {
            match peer.next_ping_delta() {
                Some(delta) => {
                    if let Some(cb) = inner.callbacks.pong() {
                        run_callback("pong callback", (), || cb(peer, delta));
                    }
                }
                None => warn!(peer = %peer, "unsolicited PONG"),
            }
            FrameOutcome::Continue
        }

        MsgType::Die => {
            let action = match inner.callbacks.die() {
                Some(cb) => {
                    run_callback("die callback", DieAction::Die, || cb(peer, frame.num_id))
                }
                None => DieAction::Die,
            };
            info!(peer = %peer, num_id = frame.num_id,
                should_die = (action == DieAction::Die), "received DIE");
            if action == DieAction::Die {
                // Shut down from a fresh task: this handler is one of the
                // workers shutdown() joins.
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = shutdown(&inner).await {
                        debug!(error = %e, "die-initiated shutdown");
                    }
                });
            }
            FrameOutcome::Continue
        }
    }
}

/// Look our subscription up by id and hand the captures to its callback.
fn handle_msg(inner: &Arc<BusInner>, peer: &Arc<Peer>, frame: &Frame) {
    let subscription = {
        let state = inner.state.lock().unwrap();
        u32::try_from(frame.num_id)
            .ok()
            .and_then(|id| state.registry.subscription(id))
    };
    match subscription {
        Some((regexp, callback)) => {
            debug!(peer = %peer, num_id = frame.num_id, regexp = %regexp, "message dispatched");
            run_callback("subscription callback", (), || {
                callback(peer, &frame.params);
            });
        }
        None => {
            // The peer may still be sending to a subscription we removed.
            warn!(peer = %peer, num_id = frame.num_id,
                "asked to handle an unknown subscription, ignoring");
        }
    }
}

fn fire_regexp_change(
    inner: &Arc<BusInner>,
    peer: &Arc<Peer>,
    event: RegexpEvent,
    num_id: i64,
    regexp: &str,
) {
    if let Some(cb) = inner.callbacks.regexp_change() {
        run_callback("regexp change callback", (), || {
            cb(peer, event, num_id, regexp);
        });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
