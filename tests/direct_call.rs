//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! End-to-end scenarios over the public [`callcore::api`] surface,
//! using the in-memory [`callcore::sim`] doubles in place of a real
//! media flow and backend transport (teacher convention:
//! `tests/incoming.rs` / `tests/outgoing.rs` against `SimPlatform`).

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use callcore::api;
use callcore::sim::{RecordedEvent, RecordingObserver, SimFlowFactory, SimTransport};
use callcore::{CallMediaType, CallState, ConversationType, VideoState};

fn spawn_peer_with_flow_factory(userid: &str, clientid: &str) -> (Peer, Arc<Mutex<SimTransport>>, Arc<SimFlowFactory>) {
    let observer = RecordingObserver::default();
    let transport = Arc::new(Mutex::new(SimTransport::default()));
    let flow_factory = Arc::new(SimFlowFactory::default());
    let handle = api::create(
        userid.into(),
        clientid.into(),
        Default::default(),
        Box::new(observer.clone()),
        Box::new(TransportRelay(transport.clone())),
        flow_factory.clone(),
    );
    (Peer { handle, observer }, transport, flow_factory)
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Polls `f` until it returns `true` or `timeout` elapses, rather than
/// guessing a fixed sleep for the marshal's next loop iteration to
/// drain an in-flight flow event.
fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Spawns a thread that feeds every message `rx` receives into
/// `dest`'s `recv_msg`, standing in for the backend relay.
fn spawn_router(rx: mpsc::Receiver<(String, Vec<u8>)>, dest: api::Handle) {
    std::thread::spawn(move || {
        for (convid, bytes) in rx {
            let t = now();
            let _ = api::recv_msg(dest, convid, t, t, bytes);
        }
    });
}

struct Peer {
    handle: api::Handle,
    observer: RecordingObserver,
}

fn spawn_peer(userid: &str, clientid: &str) -> (Peer, Arc<Mutex<SimTransport>>) {
    let observer = RecordingObserver::default();
    let transport = Arc::new(Mutex::new(SimTransport::default()));
    let handle = api::create(
        userid.into(),
        clientid.into(),
        Default::default(),
        Box::new(observer.clone()),
        Box::new(TransportRelay(transport.clone())),
        Arc::new(SimFlowFactory::default()),
    );
    (Peer { handle, observer }, transport)
}

/// `api::create` takes ownership of the [`callcore::transport::Transport`]
/// it's given, so the test keeps its own `Arc` to the underlying
/// [`SimTransport`] (for `set_peer`) and hands this thin forwarding
/// wrapper to the instance instead.
struct TransportRelay(Arc<Mutex<SimTransport>>);
impl callcore::transport::Transport for TransportRelay {
    fn send(
        &mut self,
        ctx: callcore::transport::SendContext,
        convid: &callcore::ConversationId,
        self_userid: &callcore::UserId,
        self_clientid: &callcore::common::ClientId,
        dest_userid: Option<&callcore::UserId>,
        dest_clientid: Option<&callcore::common::ClientId>,
        bytes: &[u8],
        transient: bool,
    ) -> callcore::Result<()> {
        self.0
            .lock()
            .expect("sim transport mutex poisoned")
            .send(ctx, convid, self_userid, self_clientid, dest_userid, dest_clientid, bytes, transient)
    }
}

#[test]
fn one_to_one_happy_path_rings_answers_and_tears_down() {
    let _ = env_logger::try_init();

    let (alice, alice_transport) = spawn_peer("alice", "a1");
    let (bob, bob_transport) = spawn_peer("bob", "b1");

    let (tx_to_bob, rx_to_bob) = mpsc::channel();
    let (tx_to_alice, rx_to_alice) = mpsc::channel();
    alice_transport.lock().unwrap().set_peer(tx_to_bob);
    bob_transport.lock().unwrap().set_peer(tx_to_alice);
    spawn_router(rx_to_bob, bob.handle);
    spawn_router(rx_to_alice, alice.handle);

    let convid = "conv-1".to_string();
    api::start(alice.handle, convid.clone(), ConversationType::OneOnOne, CallMediaType::Normal, false)
        .expect("start should be accepted on a fresh convid");

    assert!(
        wait_until(Duration::from_secs(2), || api::get_state(bob.handle, convid.clone())
            .map(|s| s == CallState::Incoming)
            .unwrap_or(false)),
        "bob never saw the incoming call"
    );
    assert!(bob
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, RecordedEvent::Incoming { should_ring: true, .. })));

    api::answer(bob.handle, convid.clone(), CallMediaType::Normal, false).expect("answer should succeed");

    assert!(
        wait_until(Duration::from_secs(2), || alice
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::Answered { .. }))),
        "alice never saw the answered callback"
    );

    api::end(alice.handle, convid.clone()).expect("end should succeed while answered");

    assert!(
        wait_until(Duration::from_secs(2), || bob
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::Close { .. }))),
        "bob never saw a close callback after alice hung up"
    );

    // The call entry is freed synchronously once Connection reaches
    // Terminating; a second `end` on the same convid is ENOENT.
    assert!(api::end(alice.handle, convid).is_err());
}

#[test]
fn reject_before_answer_never_establishes_media() {
    let _ = env_logger::try_init();

    let (alice, alice_transport) = spawn_peer("alice", "a1");
    let (bob, bob_transport) = spawn_peer("bob", "b1");

    let (tx_to_bob, rx_to_bob) = mpsc::channel();
    let (tx_to_alice, rx_to_alice) = mpsc::channel();
    alice_transport.lock().unwrap().set_peer(tx_to_bob);
    bob_transport.lock().unwrap().set_peer(tx_to_alice);
    spawn_router(rx_to_bob, bob.handle);
    spawn_router(rx_to_alice, alice.handle);

    let convid = "conv-2".to_string();
    api::start(alice.handle, convid.clone(), ConversationType::OneOnOne, CallMediaType::Normal, false).unwrap();

    assert!(wait_until(Duration::from_secs(2), || api::get_state(bob.handle, convid.clone())
        .map(|s| s == CallState::Incoming)
        .unwrap_or(false)));

    api::reject(bob.handle, convid.clone()).expect("reject should succeed while pending incoming");
    assert!(api::reject(bob.handle, convid.clone()).is_err(), "second reject has nothing left to reject");

    assert!(wait_until(Duration::from_secs(2), || alice
        .observer
        .events()
        .iter()
        .any(|e| matches!(e, RecordedEvent::Close { .. }))));
}

#[test]
fn propsync_after_channel_estab_travels_over_the_data_channel() {
    let _ = env_logger::try_init();

    let (alice, alice_transport, alice_flows) = spawn_peer_with_flow_factory("alice", "a1");
    let (bob, bob_transport) = spawn_peer("bob", "b1");

    let (tx_to_bob, rx_to_bob) = mpsc::channel();
    let (tx_to_alice, rx_to_alice) = mpsc::channel();
    alice_transport.lock().unwrap().set_peer(tx_to_bob);
    bob_transport.lock().unwrap().set_peer(tx_to_alice);
    spawn_router(rx_to_bob, bob.handle);
    spawn_router(rx_to_alice, alice.handle);

    // Both sides start already negotiated for video, so the later
    // property change below is a plain PROPSYNC rather than a
    // video-escalation restart (spec.md §4.3 "Restart & recovery"
    // triggers on the *first* switch to sending video, not a later
    // change once video is already part of the call).
    let convid = "conv-3".to_string();
    api::start(alice.handle, convid.clone(), ConversationType::OneOnOne, CallMediaType::Video, false).unwrap();

    assert!(wait_until(Duration::from_secs(2), || api::get_state(bob.handle, convid.clone())
        .map(|s| s == CallState::Incoming)
        .unwrap_or(false)));

    api::answer(bob.handle, convid.clone(), CallMediaType::Video, false).unwrap();

    // Both sides reach the data channel moments after the answer, same
    // as a real flow completing DTLS/ICE right after the SDP exchange.
    assert!(
        wait_until(Duration::from_secs(2), || alice
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::DcEstab { .. }))),
        "alice never saw dc_estab"
    );
    assert!(
        wait_until(Duration::from_secs(2), || bob
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, RecordedEvent::DcEstab { .. }))),
        "bob never saw dc_estab"
    );

    // Toggling video send re-syncs properties; once the channel is
    // established this travels as PROPSYNC over the data channel rather
    // than a fresh backend message.
    assert!(alice_flows.dce_sent().is_empty(), "nothing should have used the data channel yet");
    let backend_sends_before = alice_transport.lock().unwrap().send_count();
    api::set_video_send_state(alice.handle, convid.clone(), VideoState::Paused)
        .expect("toggling video send state should be accepted once connected");

    assert!(
        wait_until(Duration::from_secs(2), || !alice_flows.dce_sent().is_empty()),
        "PROPSYNC never travelled over alice's data channel"
    );
    let carried = alice_flows.dce_sent();
    assert!(
        carried.iter().any(|bytes| String::from_utf8_lossy(bytes).contains("PROPSYNC")),
        "the data-channel payload should be the PROPSYNC message, got {carried:?}"
    );
    // Alice's backend transport never saw it: the whole point of routing
    // over the data channel is that it bypasses `Transport::send`.
    assert_eq!(alice_transport.lock().unwrap().send_count(), backend_sends_before);
}
