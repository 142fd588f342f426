//! The agent: TCP server, peers directory, dispatch, and the public API.
//!
//! One `IvyBus` is one agent on one bus.  All state shared between the
//! worker tasks lives behind a single `std::sync::Mutex` (`BusState`);
//! the critical sections are short and the lock is never held across an
//! await point, a socket send, a callback, or a regex compile.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::collections::HashMap;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::{
    run_callback, ApplicationEvent, CallbackSlots, DieAction, MsgCallback, RegexpEvent,
};
use crate::discovery;
use crate::error::IvyError;
use crate::handler;
use crate::peer::{Peer, PeerStatus};
use crate::registry::Registry;
use crate::timer::TimerTable;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// How long `stop` waits for each worker task before aborting it.
const JOIN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub(crate) struct BusState {
    pub peers: HashMap<(IpAddr, u16), Arc<Peer>>,
    pub registry: Registry,
}

/// Everything the worker tasks share.
pub(crate) struct BusInner {
    pub agent_name: String,
    pub ready_message: Option<String>,
    pub state: Mutex<BusState>,
    pub callbacks: CallbackSlots,
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
    pub alive: Arc<AtomicBool>,
    timers: TimerTable,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
    agent_id: String,
    tcp_port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl BusInner {
    /// Register a peer, failing on a duplicate address or (when announced)
    /// a duplicate agent id — the latter catches an agent reconnecting
    /// from a fresh ephemeral port before its old record is reaped.
    pub(crate) fn register_peer(
        &self,
        ip: IpAddr,
        port: u16,
        agent_id: Option<String>,
        agent_name: Option<String>,
    ) -> Result<Arc<Peer>, IvyError> {
        let mut state = self.state.lock().unwrap();
        if state.peers.contains_key(&(ip, port)) {
            return Err(IvyError::DuplicatePeer(format!("{}:{}", ip, port)));
        }
        if let Some(ref id) = agent_id {
            if state
                .peers
                .values()
                .any(|p| p.agent_id() == Some(id.as_str()))
            {
                return Err(IvyError::DuplicatePeer(format!("agent id {}", id)));
            }
        }
        let peer = Arc::new(Peer::new(ip, port, agent_id, agent_name));
        state.peers.insert((ip, port), peer.clone());
        Ok(peer)
    }

    /// Match `text` against every known peer binding and send one MSG per
    /// matching (peer, subscription) pair; with `to`, only that peer's
    /// pairs.  Returns the pair count.
    pub(crate) fn dispatch(&self, text: &str, to: Option<&Arc<Peer>>) -> usize {
        let bindings = { self.state.lock().unwrap().registry.snapshot_bindings() };

        let mut count = 0;
        for (pattern, clients) in bindings {
            let Some(caps) = pattern.captures(text) else {
                continue;
            };
            // The reference matcher is anchored at the start of the text.
            if caps.get(0).map_or(true, |m| m.start() != 0) {
                continue;
            }
            let captures: Vec<String> = caps
                .iter()
                .skip(1)
                .map(|group| group.map_or_else(String::new, |m| m.as_str().to_owned()))
                .collect();
            for (peer, remote_id) in &clients {
                if to.map_or(true, |target| Arc::ptr_eq(target, peer)) {
                    peer.send_message(*remote_id, &captures);
                    count += 1;
                }
            }
        }
        count
    }
}

/// Drop a peer from the directory and purge its bindings.  With
/// `fire_callback`, the application *disconnected* callback runs — once,
/// because only the caller that actually removes the entry gets here.
pub(crate) fn remove_peer(inner: &Arc<BusInner>, peer: &Arc<Peer>, fire_callback: bool) {
    let removed = {
        let mut state = inner.state.lock().unwrap();
        let removed = state.peers.remove(&(peer.ip(), peer.port()));
        if removed.is_some() {
            state.registry.unbind_all(peer);
        }
        removed
    };
    let Some(peer) = removed else {
        debug!(peer = %peer, "removal of an unregistered peer, ignoring");
        return;
    };
    peer.close_outbox();
    debug!(peer = %peer, "peer removed");
    if fire_callback {
        if let Some(cb) = inner.callbacks.app() {
            run_callback("application callback (disconnection)", (), || {
                cb(&peer, ApplicationEvent::Disconnected);
            });
        }
    }
}

/// Track a worker task for shutdown to join, first dropping handles of
/// workers that already finished so peer churn does not accumulate them.
pub(crate) fn track_task(inner: &BusInner, handle: JoinHandle<()>) {
    let mut tasks = inner.tasks.lock().unwrap();
    tasks.retain(|h| !h.is_finished());
    tasks.push(handle);
}

// ---------------------------------------------------------------------------
// Worker loops
// ---------------------------------------------------------------------------

async fn run_accept(
    inner: Arc<BusInner>,
    listener: TcpListener,
    listen_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let spawn_shutdown = shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => {
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        handler::spawn_connection(
                            inner.clone(),
                            stream,
                            None,
                            listen_port,
                            spawn_shutdown,
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "tcp accept error");
                    }
                }
            }
        }
    }
    info!("tcp server stopped");
}

/// Stop the agent: BYE to every initialized peer, close everything, join
/// every worker, then deliver the *disconnected* callbacks.
pub(crate) async fn shutdown(inner: &Arc<BusInner>) -> Result<(), IvyError> {
    let mut guard = inner.running.lock().await;
    let running = guard.take().ok_or(IvyError::NotRunning)?;
    inner.alive.store(false, Ordering::SeqCst);
    inner.timers.clear();

    let peers: Vec<Arc<Peer>> = {
        let mut state = inner.state.lock().unwrap();
        state.registry.clear_bindings();
        state.peers.drain().map(|(_, peer)| peer).collect()
    };
    for peer in &peers {
        if peer.status() == PeerStatus::Initialized {
            peer.wave_bye(0);
        }
        // Writers flush what is queued (the BYE included), then exit.
        peer.close_outbox();
    }

    let _ = running.shutdown_tx.send(true);
    let handles: Vec<JoinHandle<()>> = inner.tasks.lock().unwrap().drain(..).collect();
    for mut handle in handles {
        // A writer stuck on a full TCP buffer could otherwise hold the
        // shutdown hostage; give each worker a bounded grace period.
        if tokio::time::timeout(JOIN_GRACE, &mut handle).await.is_err() {
            warn!("worker did not exit in time, aborting it");
            handle.abort();
        }
    }
    drop(guard);

    if let Some(cb) = inner.callbacks.app() {
        for peer in &peers {
            run_callback("application callback (disconnection)", (), || {
                cb(peer, ApplicationEvent::Disconnected);
            });
        }
    }
    info!(agent = %inner.agent_name, "ivy agent stopped");
    Ok(())
}

fn make_agent_id(agent_name: &str, port: u16) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let noise: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("{}{}{:05}{}", agent_name, stamp, noise, port)
}

// ---------------------------------------------------------------------------
// IvyBus
// ---------------------------------------------------------------------------

/// One agent on an Ivy bus.
///
/// Cheap to clone through `Arc` internally; a single value is shared with
/// every callback and task.  All messaging methods are synchronous —
/// frames are enqueued on per-peer outboxes — so they may be called from
/// inside callbacks without restriction.
pub struct IvyBus {
    pub(crate) inner: Arc<BusInner>,
}

impl IvyBus {
    /// Create an agent.  `ready_message`, when set and non-empty, is sent
    /// to every newly initialized peer through the normal dispatch path.
    pub fn new(agent_name: impl Into<String>, ready_message: Option<&str>) -> IvyBus {
        IvyBus {
            inner: Arc::new(BusInner {
                agent_name: agent_name.into(),
                ready_message: ready_message.map(str::to_owned),
                state: Mutex::new(BusState {
                    peers: HashMap::new(),
                    registry: Registry::default(),
                }),
                callbacks: CallbackSlots::default(),
                tasks: Mutex::new(Vec::new()),
                alive: Arc::new(AtomicBool::new(false)),
                timers: TimerTable::default(),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.inner.agent_name
    }

    // -- callback registration ----------------------------------------------

    /// Called on every peer connection and disconnection.
    pub fn bind_app_event(
        &self,
        cb: impl Fn(&Arc<Peer>, ApplicationEvent) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.app.write().unwrap() = Some(Arc::new(cb));
    }

    /// Called when a peer asks us to die; return `ShouldNotDie` to veto.
    pub fn bind_die(&self, cb: impl Fn(&Arc<Peer>, i64) -> DieAction + Send + Sync + 'static) {
        *self.inner.callbacks.die.write().unwrap() = Some(Arc::new(cb));
    }

    pub fn bind_direct_msg(&self, cb: impl Fn(&Arc<Peer>, i64, &str) + Send + Sync + 'static) {
        *self.inner.callbacks.direct.write().unwrap() = Some(Arc::new(cb));
    }

    pub fn bind_regexp_change(
        &self,
        cb: impl Fn(&Arc<Peer>, RegexpEvent, i64, &str) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.regexp_change.write().unwrap() = Some(Arc::new(cb));
    }

    pub fn bind_pong(
        &self,
        cb: impl Fn(&Arc<Peer>, std::time::Duration) + Send + Sync + 'static,
    ) {
        *self.inner.callbacks.pong.write().unwrap() = Some(Arc::new(cb));
    }

    // -- lifecycle -----------------------------------------------------------

    /// Join the bus: bind the TCP server, announce on UDP, start serving.
    ///
    /// `bus` is `"A.B.C[.D]:port"`; `None` falls back to `IVYBUS`, then to
    /// `127:2010`.
    pub async fn start(&self, bus: Option<&str>) -> Result<(), IvyError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(IvyError::AlreadyRunning);
        }

        let (bus_addr, bus_port) = ivy_wire::decode_bus(bus)?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let listen_port = listener.local_addr()?.port();
        let udp = discovery::bind_udp(bus_addr, bus_port)?;
        let agent_id = make_agent_id(&self.inner.agent_name, listen_port);

        info!(
            agent = %self.inner.agent_name,
            port = listen_port,
            bus_addr = %bus_addr,
            bus_port,
            "starting ivy agent"
        );

        self.inner.alive.store(true, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(run_accept(
            self.inner.clone(),
            listener,
            listen_port,
            shutdown_rx.clone(),
        ));
        let discovery_task = tokio::spawn(discovery::serve(
            self.inner.clone(),
            udp,
            (bus_addr, bus_port),
            listen_port,
            agent_id.clone(),
            shutdown_rx,
        ));
        track_task(&self.inner, accept_task);
        track_task(&self.inner, discovery_task);

        *running = Some(Running {
            agent_id,
            tcp_port: listen_port,
            shutdown_tx,
        });
        Ok(())
    }

    /// Leave the bus: BYE everyone, stop every worker task.
    pub async fn stop(&self) -> Result<(), IvyError> {
        shutdown(&self.inner).await
    }

    /// Block until the agent stops (by `stop` or an accepted DIE).
    pub async fn wait(&self) {
        let rx = {
            self.inner
                .running
                .lock()
                .await
                .as_ref()
                .map(|r| r.shutdown_tx.subscribe())
        };
        if let Some(mut rx) = rx {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Our TCP listening port, while running.
    pub async fn port(&self) -> Option<u16> {
        self.inner.running.lock().await.as_ref().map(|r| r.tcp_port)
    }

    /// Our unique agent id, while running.
    pub async fn agent_id(&self) -> Option<String> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.agent_id.clone())
    }

    // -- our subscriptions ---------------------------------------------------

    /// Subscribe: the callback runs for every received message matching
    /// `regexp`, with one parameter per capture group.  Returns the
    /// subscription id, unique for the lifetime of the agent.
    pub fn bind_msg(
        &self,
        regexp: &str,
        cb: impl Fn(&Arc<Peer>, &[String]) + Send + Sync + 'static,
    ) -> u32 {
        let callback: MsgCallback = Arc::new(cb);
        let (id, peers) = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.registry.add_subscription(regexp, callback);
            let peers: Vec<Arc<Peer>> = state.peers.values().cloned().collect();
            (id, peers)
        };
        for peer in peers {
            peer.send_new_subscription(id, regexp);
        }
        debug!(id, regexp, "subscription registered");
        id
    }

    /// Unsubscribe; returns the regexp that was bound.
    pub fn unbind_msg(&self, id: u32) -> Result<String, IvyError> {
        let (regexp, peers) = {
            let mut state = self.inner.state.lock().unwrap();
            let regexp = state
                .registry
                .remove_subscription(id)
                .ok_or(IvyError::UnknownSubscription(id))?;
            let peers: Vec<Arc<Peer>> = state.peers.values().cloned().collect();
            (regexp, peers)
        };
        for peer in peers {
            peer.remove_subscription(id);
        }
        debug!(id, regexp = %regexp, "subscription removed");
        Ok(regexp)
    }

    /// Our `(id, regexp)` subscriptions.
    pub fn get_messages(&self) -> Vec<(u32, String)> {
        self.inner.state.lock().unwrap().registry.subscriptions()
    }

    // -- messaging -----------------------------------------------------------

    /// Broadcast `text`; every peer receives one MSG per subscription of
    /// its that matches.  Returns the number of (peer, subscription) pairs
    /// that matched.
    pub fn send_msg(&self, text: &str) -> usize {
        self.inner.dispatch(text, None)
    }

    pub fn send_direct_msg(&self, peer: &Arc<Peer>, num_id: i64, msg: &str) {
        peer.send_direct_message(num_id, msg);
    }

    /// Direct message to the agent(s) named `agent_name`.  Returns whether
    /// at least one peer was addressed.
    pub fn send_direct_msg_to(
        &self,
        agent_name: &str,
        num_id: i64,
        msg: &str,
        stop_on_first: bool,
    ) -> bool {
        let peers: Vec<Arc<Peer>> = {
            let state = self.inner.state.lock().unwrap();
            state.peers.values().cloned().collect()
        };
        let mut sent = false;
        for peer in peers {
            if peer.name().as_deref() != Some(agent_name) {
                continue;
            }
            peer.send_direct_message(num_id, msg);
            sent = true;
            if stop_on_first {
                break;
            }
        }
        sent
    }

    pub fn send_die_msg(&self, peer: &Arc<Peer>) {
        peer.send_die(0, "");
    }

    pub fn send_error(&self, peer: &Arc<Peer>, num_id: i64, msg: &str) {
        peer.send_error(num_id, msg);
    }

    /// PING a peer; the answering PONG arrives at the `bind_pong` callback
    /// with the round-trip time.
    pub fn send_ping(&self, peer: &Arc<Peer>) {
        peer.send_ping();
    }

    // -- bus introspection ---------------------------------------------------

    /// Names of every initialized peer.
    pub fn get_application_list(&self) -> Vec<String> {
        let state = self.inner.state.lock().unwrap();
        state
            .peers
            .values()
            .filter(|p| p.status() == PeerStatus::Initialized)
            .filter_map(|p| p.name())
            .collect()
    }

    /// The peer registered under `name`; when several share the name, an
    /// arbitrary one.
    pub fn get_application(&self, name: &str) -> Option<Arc<Peer>> {
        let state = self.inner.state.lock().unwrap();
        state
            .peers
            .values()
            .find(|p| p.name().as_deref() == Some(name))
            .cloned()
    }

    /// A peer's subscriptions, as `(remote id, regexp)` pairs.
    pub fn get_application_messages(&self, peer: &Arc<Peer>) -> Vec<(i64, String)> {
        self.inner.state.lock().unwrap().registry.bindings_of(peer)
    }

    // -- timers --------------------------------------------------------------

    /// Run `cb` every `delay_ms`, `count` times (`0` = until removed or
    /// the agent stops).  Returns the timer id.
    pub fn timer_repeat_after(
        &self,
        count: u32,
        delay_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
    ) -> u64 {
        self.inner
            .timers
            .spawn(count, delay_ms, Arc::new(cb), self.inner.alive.clone())
    }

    /// Change a timer's delay; effective after its current sleep.
    pub fn timer_modify(&self, id: u64, delay_ms: u64) -> Result<(), IvyError> {
        if self.inner.timers.modify(id, delay_ms) {
            Ok(())
        } else {
            Err(IvyError::UnknownTimer(id))
        }
    }

    pub fn timer_remove(&self, id: u64) -> Result<(), IvyError> {
        if self.inner.timers.remove(id) {
            Ok(())
        } else {
            Err(IvyError::UnknownTimer(id))
        }
    }
}

impl Clone for IvyBus {
    fn clone(&self) -> IvyBus {
        IvyBus {
            inner: self.inner.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
