//! End-to-end: direct messages, ping/pong round-trips, and DIE handling
//! (vetoed and accepted) between real agents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusty_ivy::{ApplicationEvent, DieAction, IvyBus};

async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
    deadline
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn track_connections(bus: &IvyBus) -> Arc<Mutex<Vec<String>>> {
    let connected = Arc::new(Mutex::new(Vec::new()));
    let seen = connected.clone();
    bus.bind_app_event(move |peer, event| {
        if event == ApplicationEvent::Connected {
            if let Some(name) = peer.name() {
                seen.lock().unwrap().push(name);
            }
        }
    });
    connected
}

fn has_agent(log: &Arc<Mutex<Vec<String>>>, name: &str) -> bool {
    log.lock().unwrap().iter().any(|n| n == name)
}

// ---------------------------------------------------------------------------
// S4: direct message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_message_reaches_the_named_agent() {
    let bus = "127:47111";
    let a = IvyBus::new("sender", None);
    let b = IvyBus::new("receiver", None);
    let a_seen = track_connections(&a);

    let received: Arc<Mutex<Vec<(Option<String>, i64, String)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.bind_direct_msg(move |peer, num_id, msg| {
        sink.lock()
            .unwrap()
            .push((peer.name(), num_id, msg.to_owned()));
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("a to see the receiver", || has_agent(&a_seen, "receiver")).await;

    assert!(a.send_direct_msg_to("receiver", 42, "ping", true));
    assert!(!a.send_direct_msg_to("nobody", 1, "x", true));

    wait_until("the direct message", || !received.lock().unwrap().is_empty()).await;
    let got = received.lock().unwrap();
    assert_eq!(
        got.as_slice(),
        &[(Some("sender".to_owned()), 42, "ping".to_owned())]
    );

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// S6: ping/pong
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_is_answered_and_the_delta_is_positive() {
    let bus = "127:47112";
    let a = IvyBus::new("pinger", None);
    let b = IvyBus::new("ponger", None);
    let a_seen = track_connections(&a);

    let deltas: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = deltas.clone();
    a.bind_pong(move |_, delta| {
        sink.lock().unwrap().push(delta);
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("a to see the ponger", || has_agent(&a_seen, "ponger")).await;

    let peer_b = a.get_application("ponger").expect("peer record");
    a.send_ping(&peer_b);

    wait_until("the pong", || !deltas.lock().unwrap().is_empty()).await;
    let got = deltas.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert!(got[0] > Duration::ZERO, "round trip takes nonzero time");

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// DIE: vetoed, then accepted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn die_can_be_vetoed_and_otherwise_stops_the_agent() {
    let bus = "127:47113";
    let a = IvyBus::new("judge", None);
    let b = IvyBus::new("victim", None);
    let a_seen = track_connections(&a);

    let die_requests = Arc::new(AtomicUsize::new(0));
    let veto_count = die_requests.clone();
    b.bind_die(move |_, _| {
        // Veto the first request, accept the second.
        if veto_count.fetch_add(1, Ordering::SeqCst) == 0 {
            DieAction::ShouldNotDie
        } else {
            DieAction::Die
        }
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("a to see the victim", || has_agent(&a_seen, "victim")).await;

    let peer_b = a.get_application("victim").expect("peer record");
    a.send_die_msg(&peer_b);
    wait_until("the vetoed die", || die_requests.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.is_running(), "vetoed DIE must not stop the agent");

    a.send_die_msg(&peer_b);
    wait_until("the victim to stop", || !b.is_running()).await;

    // The dead agent disappears from the bus.
    wait_until("a to reap the victim", || {
        !a.get_application_list().contains(&"victim".to_owned())
    })
    .await;

    a.stop().await.unwrap();
}
