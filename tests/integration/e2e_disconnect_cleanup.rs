//! End-to-end: disconnect handling against a wire-level scripted agent.
//!
//! A raw TCP client speaking the Ivy frame format byte-for-byte stands in
//! for a remote agent, so these tests cover abrupt peer death (no BYE),
//! the BYE we owe peers on shutdown, and the connected/disconnected
//! pairing — without a second in-process runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use rusty_ivy::wire::{decode, encode_raw, MsgType};
use rusty_ivy::{ApplicationEvent, IvyBus};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

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

struct EventCounts {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

fn track_events(bus: &IvyBus) -> Arc<EventCounts> {
    let counts = Arc::new(EventCounts {
        connected: AtomicUsize::new(0),
        disconnected: AtomicUsize::new(0),
    });
    let seen = counts.clone();
    bus.bind_app_event(move |_, event| match event {
        ApplicationEvent::Connected => {
            seen.connected.fetch_add(1, Ordering::SeqCst);
        }
        ApplicationEvent::Disconnected => {
            seen.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    });
    counts
}

/// A scripted wire-level agent: connects, introduces itself with one
/// subscription, and then does whatever the test says.
struct RawAgent {
    reader: BufReader<TcpStream>,
}

impl RawAgent {
    async fn connect_and_init(port: u16, name: &str, regexp: &str) -> RawAgent {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to the agent under test");
        // Pose as an agent listening on our ephemeral port; START_INIT
        // carries the sender's listening port as its numeric id.
        let own_port = stream.local_addr().expect("local addr").port();
        let mut agent = RawAgent {
            reader: BufReader::new(stream),
        };
        agent
            .send(encode_raw(MsgType::StartInit, i64::from(own_port), name))
            .await;
        agent.send(encode_raw(MsgType::AddRegexp, 0, regexp)).await;
        agent.send(encode_raw(MsgType::EndInit, 0, "")).await;
        agent
    }

    async fn send(&mut self, bytes: Vec<u8>) {
        self.reader
            .get_mut()
            .write_all(&bytes)
            .await
            .expect("write to the agent under test");
    }

    /// Read frames until one of type `wanted` arrives.
    async fn read_until_type(&mut self, wanted: MsgType) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut line = String::new();
                let n = self
                    .reader
                    .read_line(&mut line)
                    .await
                    .expect("read from the agent under test");
                assert!(n > 0, "EOF while waiting for {}", wanted);
                let frame = decode(line.trim_end_matches('\n')).expect("well-formed frame");
                if frame.msg_type == wanted {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a {} frame", wanted))
    }
}

// ---------------------------------------------------------------------------
// S5: abrupt peer death
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abrupt_peer_death_is_reaped_without_a_bye() {
    let a = IvyBus::new("survivor", None);
    let events = track_events(&a);
    a.start(Some("127:47121")).await.unwrap();
    let port = a.port().await.expect("listening port");

    let mut fake = RawAgent::connect_and_init(port, "doomed", "^.*$").await;
    fake.read_until_type(MsgType::EndInit).await;

    wait_until("the fake agent to connect", || {
        events.connected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(a.get_application_list().contains(&"doomed".to_owned()));
    assert_eq!(a.send_msg("anything"), 1, "the fake's ^.*$ matches");

    // Kill the connection with no BYE, as a crashed process would.
    drop(fake);

    wait_until("the disconnect callback", || {
        events.disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(a.get_application_list().is_empty());
    assert_eq!(
        a.send_msg("anything"),
        0,
        "no send may target the reaped peer"
    );

    a.stop().await.unwrap();
    assert_eq!(events.disconnected.load(Ordering::SeqCst), 1, "no double fire");
}

// ---------------------------------------------------------------------------
// BYE on either side
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_bye_frame_disconnects_cleanly() {
    let a = IvyBus::new("survivor", None);
    let events = track_events(&a);
    a.start(Some("127:47122")).await.unwrap();
    let port = a.port().await.expect("listening port");

    let mut fake = RawAgent::connect_and_init(port, "leaver", "^x$").await;
    fake.read_until_type(MsgType::EndInit).await;
    wait_until("the fake agent to connect", || {
        events.connected.load(Ordering::SeqCst) == 1
    })
    .await;

    fake.send(encode_raw(MsgType::Bye, 0, "")).await;

    wait_until("the disconnect callback", || {
        events.disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(a.get_application_list().is_empty());

    a.stop().await.unwrap();
}

#[tokio::test]
async fn stop_waves_bye_to_initialized_peers() {
    let a = IvyBus::new("polite", None);
    let events = track_events(&a);
    a.start(Some("127:47123")).await.unwrap();
    let port = a.port().await.expect("listening port");

    let mut fake = RawAgent::connect_and_init(port, "watcher", "^x$").await;
    fake.read_until_type(MsgType::EndInit).await;
    wait_until("the fake agent to connect", || {
        events.connected.load(Ordering::SeqCst) == 1
    })
    .await;

    a.stop().await.unwrap();

    // The shutdown sequence flushed a BYE before the socket closed.
    fake.read_until_type(MsgType::Bye).await;

    // Exactly one disconnected per connected, even through shutdown.
    assert_eq!(events.connected.load(Ordering::SeqCst), 1);
    assert_eq!(events.disconnected.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Protocol errors terminate only the offending connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_second_start_init_disconnects_the_offender_only() {
    let a = IvyBus::new("strict", None);
    let events = track_events(&a);
    a.start(Some("127:47124")).await.unwrap();
    let port = a.port().await.expect("listening port");

    let mut offender = RawAgent::connect_and_init(port, "offender", "^x$").await;
    offender.read_until_type(MsgType::EndInit).await;
    wait_until("the offender to connect", || {
        events.connected.load(Ordering::SeqCst) == 1
    })
    .await;

    // A second START_INIT on the same connection is a protocol error.
    offender
        .send(encode_raw(MsgType::StartInit, 0, "offender"))
        .await;

    wait_until("the offender to be dropped", || {
        events.disconnected.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(a.get_application_list().is_empty());
    assert!(a.is_running(), "the agent itself survives");

    a.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Malformed frames are logged and skipped
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_frames_do_not_cost_the_connection() {
    let a = IvyBus::new("tolerant", None);
    let events = track_events(&a);
    a.start(Some("127:47125")).await.unwrap();
    let port = a.port().await.expect("listening port");

    let mut fake = RawAgent::connect_and_init(port, "sloppy", "^ok$").await;
    fake.read_until_type(MsgType::EndInit).await;
    wait_until("the fake agent to connect", || {
        events.connected.load(Ordering::SeqCst) == 1
    })
    .await;

    // No STX, non-integer type: undecodable garbage.
    fake.send(b"garbage without structure\n".to_vec()).await;
    fake.send(b"99x 7\x02oops\n".to_vec()).await;

    // The connection survives: a PING still gets its PONG.
    fake.send(encode_raw(MsgType::Ping, 5, "")).await;
    fake.read_until_type(MsgType::Pong).await;
    assert_eq!(events.disconnected.load(Ordering::SeqCst), 0);

    a.stop().await.unwrap();
}
