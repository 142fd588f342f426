//! Per-peer connection state and send primitives.
//!
//! A `Peer` is the local record of one remote agent: its address, its
//! identity as learned from discovery and the handshake, its lifecycle
//! status, and an outbox drained by a dedicated writer task.  Frames are
//! enqueued, never written inline, so broadcast dispatch can loop over
//! every peer without ever blocking on (or failing with) one dead socket.
//!
//! All send helpers are silently dropped while the peer is not
//! `Initialized`; the handshake and BYE use the ungated enqueue path.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info};

use ivy_wire::{encode_list, encode_raw, MsgType};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Handshake progress of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    NotInitialized,
    InitInProgress,
    Initialized,
}

/// Returned when a handshake frame arrives in an illegal state.
#[derive(Debug, thiserror::Error)]
#[error("illegal handshake transition: {0}")]
pub struct IllegalTransition(pub &'static str);

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

type Outbox = mpsc::UnboundedSender<Vec<u8>>;
type OutboxRx = mpsc::UnboundedReceiver<Vec<u8>>;

/// One remote agent on the bus.
///
/// Identity (and equality) is `(ip, port)`; `agent_id` is only known for
/// peers found through UDP discovery, `agent_name` only after the remote
/// side's `START_INIT`.
pub struct Peer {
    ip: IpAddr,
    port: u16,
    agent_id: Option<String>,
    agent_name: Mutex<Option<String>>,
    status: Mutex<PeerStatus>,
    outbox: Mutex<Option<Outbox>>,
    outbox_rx: Mutex<Option<OutboxRx>>,
    ping_sent: Mutex<VecDeque<Instant>>,
}

impl Peer {
    pub(crate) fn new(
        ip: IpAddr,
        port: u16,
        agent_id: Option<String>,
        agent_name: Option<String>,
    ) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        Peer {
            ip,
            port,
            agent_id,
            agent_name: Mutex::new(agent_name),
            status: Mutex::new(PeerStatus::NotInitialized),
            outbox: Mutex::new(Some(tx)),
            outbox_rx: Mutex::new(Some(rx)),
            ping_sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `(ip, port)` pair that identifies this peer.
    pub fn addr(&self) -> (IpAddr, u16) {
        (self.ip, self.port)
    }

    /// Host string for this peer, as the applications see it.
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    /// The agent id announced over UDP, when this peer came in through
    /// discovery.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// The remote agent name, once `START_INIT` has been received.
    pub fn name(&self) -> Option<String> {
        self.agent_name.lock().unwrap().clone()
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.lock().unwrap()
    }

    // -- handshake state machine -------------------------------------------

    /// `NOT_INITIALIZED → INITIALIZATION_IN_PROGRESS`, recording the remote
    /// agent name.  The Ivy protocol allows exactly one `START_INIT` per
    /// connection.
    pub(crate) fn start_init(&self, remote_name: &str) -> Result<(), IllegalTransition> {
        let mut status = self.status.lock().unwrap();
        if *status != PeerStatus::NotInitialized {
            return Err(IllegalTransition("START_INIT received twice"));
        }
        *self.agent_name.lock().unwrap() = Some(remote_name.to_owned());
        *status = PeerStatus::InitInProgress;
        debug!(peer = %self, "handshake started");
        Ok(())
    }

    /// `→ INITIALIZED`.  Fails only when already initialized.
    pub(crate) fn end_init(&self) -> Result<(), IllegalTransition> {
        let mut status = self.status.lock().unwrap();
        if *status == PeerStatus::Initialized {
            return Err(IllegalTransition("END_INIT received twice"));
        }
        *status = PeerStatus::Initialized;
        debug!(peer = %self, "handshake complete");
        Ok(())
    }

    // -- send primitives ----------------------------------------------------

    /// Enqueue raw frame bytes regardless of status.  Used for the
    /// handshake we owe every new connection; everything else goes through
    /// the status-gated helpers.
    pub(crate) fn enqueue_raw(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.outbox.lock().unwrap().as_ref() {
            // A send error means the writer is gone; the reader side of the
            // connection performs the cleanup.
            let _ = tx.send(bytes);
        }
    }

    fn enqueue_if_initialized(&self, bytes: Vec<u8>) {
        if self.status() != PeerStatus::Initialized {
            debug!(peer = %self, "dropping send to uninitialized peer");
            return;
        }
        self.enqueue_raw(bytes);
    }

    /// MSG: the remote subscription id plus one parameter per capture group.
    pub(crate) fn send_message(&self, remote_sub_id: i64, captures: &[String]) {
        self.enqueue_if_initialized(encode_list(MsgType::Msg, remote_sub_id, captures));
    }

    pub(crate) fn send_direct_message(&self, num_id: i64, msg: &str) {
        self.enqueue_if_initialized(encode_raw(MsgType::DirectMsg, num_id, msg));
    }

    pub(crate) fn send_die(&self, num_id: i64, msg: &str) {
        self.enqueue_if_initialized(encode_raw(MsgType::Die, num_id, msg));
    }

    pub(crate) fn send_error(&self, num_id: i64, msg: &str) {
        self.enqueue_if_initialized(encode_raw(MsgType::Error, num_id, msg));
    }

    pub(crate) fn send_new_subscription(&self, sub_id: u32, regexp: &str) {
        self.enqueue_if_initialized(encode_raw(MsgType::AddRegexp, i64::from(sub_id), regexp));
    }

    pub(crate) fn remove_subscription(&self, sub_id: u32) {
        self.enqueue_if_initialized(encode_raw(MsgType::DelRegexp, i64::from(sub_id), ""));
    }

    /// BYE goes out ungated: it is the one frame we owe a peer we are about
    /// to drop, and the caller has already checked the peer is initialized.
    pub(crate) fn wave_bye(&self, num_id: i64) {
        self.enqueue_raw(encode_raw(MsgType::Bye, num_id, ""));
    }

    /// Push the send instant onto the ping FIFO and emit `PING(0)`.
    pub(crate) fn send_ping(&self) {
        if self.status() != PeerStatus::Initialized {
            debug!(peer = %self, "dropping ping to uninitialized peer");
            return;
        }
        self.ping_sent.lock().unwrap().push_back(Instant::now());
        self.enqueue_raw(encode_raw(MsgType::Ping, 0, ""));
    }

    pub(crate) fn send_pong(&self, num_id: i64) {
        self.enqueue_if_initialized(encode_raw(MsgType::Pong, num_id, ""));
    }

    /// Pop the oldest outstanding ping and return the time elapsed since it
    /// was sent.  `None` when no ping is outstanding (an unsolicited PONG).
    pub(crate) fn next_ping_delta(&self) -> Option<Duration> {
        self.ping_sent
            .lock()
            .unwrap()
            .pop_front()
            .map(|sent| sent.elapsed())
    }

    // -- writer wiring -------------------------------------------------------

    /// Hand the outbox receiver to the connection's writer task.  Yields
    /// `None` if a writer already claimed it.
    pub(crate) fn take_outbox_rx(&self) -> Option<OutboxRx> {
        self.outbox_rx.lock().unwrap().take()
    }

    /// Drop the outbox sender: the writer drains what is already queued
    /// (BYE included) and then exits, closing the socket.
    pub(crate) fn close_outbox(&self) {
        self.outbox.lock().unwrap().take();
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Peer) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Peer {}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("agent_name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}:{} ({})", self.ip, self.port, name),
            None => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain one peer's outbox into its socket.  A transport error is logged at
/// info level and the task exits; the reader side of the connection detects
/// the dead peer and performs the structured cleanup.
pub(crate) async fn run_writer(mut write_half: OwnedWriteHalf, mut rx: OutboxRx, peer_addr: String) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            info!(peer = %peer_addr, error = %e, "[ignored] error on socket send");
            break;
        }
    }
    // Sender dropped or write failed; let the FIN go out.
    let _ = write_half.shutdown().await;
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
