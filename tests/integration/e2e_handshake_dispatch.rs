//! End-to-end: discovery handshake, subscription exchange, and regex
//! dispatch between real agents on a loopback bus.
//!
//! Each test uses its own bus port so the suites can run concurrently
//! without hearing each other's announcements.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusty_ivy::{ApplicationEvent, IvyBus};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Poll `pred` until it holds, failing the test after five seconds.
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

/// Record of which agents connected, by name.
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
// S1: handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_agents_discover_each_other_and_list_each_other() {
    let bus = "127:47101";
    let a = IvyBus::new("agent-a", None);
    let b = IvyBus::new("agent-b", None);
    let a_seen = track_connections(&a);
    let b_seen = track_connections(&b);

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();

    wait_until("a to see b", || has_agent(&a_seen, "agent-b")).await;
    wait_until("b to see a", || has_agent(&b_seen, "agent-a")).await;

    // Exactly one record per logical agent, even though both sides
    // announce and both may connect out.
    assert_eq!(a.get_application_list(), vec!["agent-b".to_owned()]);
    assert_eq!(b.get_application_list(), vec!["agent-a".to_owned()]);
    assert_eq!(a_seen.lock().unwrap().len(), 1, "one connected event");
    assert_eq!(b_seen.lock().unwrap().len(), 1, "one connected event");

    let peer_b = a.get_application("agent-b").expect("peer record for b");
    assert_eq!(peer_b.host(), "127.0.0.1");

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// S2: match count and captures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_msg_returns_match_count_and_delivers_captures() {
    let bus = "127:47102";
    let a = IvyBus::new("subscriber", None);
    let b = IvyBus::new("publisher", None);
    let a_seen = track_connections(&a);

    let received: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    a.bind_msg("^hello (.*)$", move |_, captures| {
        sink.lock().unwrap().push(captures.to_vec());
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("a to see the publisher", || has_agent(&a_seen, "publisher")).await;
    // The two handshake directions are independent; wait until the
    // publisher has recorded our subscription before counting matches.
    wait_until("b to learn the subscription", || {
        b.get_application("subscriber")
            .map(|p| {
                b.get_application_messages(&p)
                    .iter()
                    .any(|(_, r)| r == "^hello (.*)$")
            })
            .unwrap_or(false)
    })
    .await;

    assert_eq!(b.send_msg("hello world"), 1);
    assert_eq!(b.send_msg("goodbye world"), 0);

    wait_until("the capture to arrive", || !received.lock().unwrap().is_empty()).await;
    let got = received.lock().unwrap();
    assert_eq!(got.as_slice(), &[vec!["world".to_owned()]]);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// S3: one frame per matching subscription
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_with_two_matching_subscriptions_receives_two_frames() {
    let bus = "127:47103";
    let a = IvyBus::new("double-subscriber", None);
    let b = IvyBus::new("publisher", None);
    let a_seen = track_connections(&a);

    let hits = Arc::new(AtomicUsize::new(0));
    let (h1, h2) = (hits.clone(), hits.clone());
    a.bind_msg("^.*$", move |_, _| {
        h1.fetch_add(1, Ordering::SeqCst);
    });
    a.bind_msg("^.*$", move |_, _| {
        h2.fetch_add(1, Ordering::SeqCst);
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("a to see the publisher", || has_agent(&a_seen, "publisher")).await;
    wait_until("b to learn both subscriptions", || {
        b.get_application("double-subscriber")
            .map(|p| b.get_application_messages(&p).len() == 2)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(b.send_msg("x"), 2, "one (peer, subscription) pair each");
    wait_until("both callbacks to fire", || {
        hits.load(Ordering::SeqCst) == 2
    })
    .await;

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Ready message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_message_reaches_a_matching_subscriber_only() {
    let bus = "127:47104";
    let a = IvyBus::new("greeter", Some("greeter READY"));
    let b = IvyBus::new("listener", None);

    let greetings = Arc::new(AtomicUsize::new(0));
    let seen = greetings.clone();
    b.bind_msg("^greeter READY$", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();

    wait_until("the ready message", || greetings.load(Ordering::SeqCst) == 1).await;

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Subscription visibility and runtime changes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peers_see_subscriptions_added_and_removed_at_runtime() {
    let bus = "127:47105";
    let a = IvyBus::new("subscriber", None);
    let b = IvyBus::new("watcher", None);
    let b_seen = track_connections(&b);

    let initial = a.bind_msg("^initial$", |_, _| {});

    a.start(Some(bus)).await.unwrap();
    b.start(Some(bus)).await.unwrap();
    wait_until("b to see the subscriber", || has_agent(&b_seen, "subscriber")).await;

    let peer_a = b.get_application("subscriber").expect("peer record");
    wait_until("the handshake subscription", || {
        b.get_application_messages(&peer_a)
            .iter()
            .any(|(_, r)| r == "^initial$")
    })
    .await;

    // A runtime bind propagates to connected peers.
    let late = a.bind_msg("^late$", |_, _| {});
    assert!(late > initial);
    wait_until("the late subscription", || {
        b.get_application_messages(&peer_a)
            .iter()
            .any(|(_, r)| r == "^late$")
    })
    .await;
    assert_eq!(b.send_msg("late"), 1);

    // And so does an unbind.
    a.unbind_msg(initial).unwrap();
    wait_until("the unbind", || {
        !b.get_application_messages(&peer_a)
            .iter()
            .any(|(_, r)| r == "^initial$")
    })
    .await;
    assert_eq!(b.send_msg("initial"), 0);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}
