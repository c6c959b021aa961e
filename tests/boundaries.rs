//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Boundary behaviors from spec.md §8 exercised through the
//! handle-based [`callcore::api`] surface rather than the internal
//! `CallManager` (covered by `core::manager`'s own unit tests).

use std::sync::Arc;
use std::time::{Duration, Instant};

use callcore::api;
use callcore::flow::TurnServer;
use callcore::sim::{RecordedEvent, RecordingObserver, SimFlowFactory, SimTransport};
use callcore::{CallMediaType, CallState, ConversationType};

/// Polls until `f` returns `true` or `timeout` elapses, to observe the
/// async candidate-gather round-trip [`callcore::sim::SimFlow`] still
/// goes through before a call reaches PENDING_OUTGOING.
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

fn turnserver(n: u32) -> TurnServer {
    TurnServer {
        url: format!("turn:relay{n}.example.org"),
        username: "u".into(),
        credential: "c".into(),
    }
}

#[test]
fn invalid_handle_is_rejected_on_every_entry_point() {
    let bogus: api::Handle = 0xDEAD_BEEF;
    assert!(api::start(bogus, "c1".into(), ConversationType::OneOnOne, CallMediaType::Normal, false).is_err());
    assert!(api::get_state(bogus, "c1".into()).is_err());
    assert!(api::destroy(bogus).is_err());
}

#[test]
fn destroyed_instance_handle_cannot_be_reused() {
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(RecordingObserver::default()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );

    api::start(handle, "c1".into(), ConversationType::OneOnOne, CallMediaType::Normal, false).unwrap();
    api::destroy(handle).expect("destroy should succeed on a live handle");

    assert!(api::start(handle, "c2".into(), ConversationType::OneOnOne, CallMediaType::Normal, false).is_err());
    assert!(api::destroy(handle).is_err(), "destroying twice is ENOENT the second time");
}

#[test]
fn destroy_drains_the_core_thread_and_fires_shutdown() {
    let observer = RecordingObserver::default();
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(observer.clone()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );
    api::start(handle, "c1".into(), ConversationType::OneOnOne, CallMediaType::Normal, false).unwrap();

    api::destroy(handle).expect("destroy should succeed on a live handle");

    assert!(
        wait_until(Duration::from_secs(2), || observer.events().contains(&RecordedEvent::Shutdown)),
        "observer never saw shutdown after destroy, the core thread is stuck"
    );
}

#[test]
fn set_mute_updates_state_and_notifies_the_observer() {
    let observer = RecordingObserver::default();
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(observer.clone()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );

    assert!(!api::get_mute(handle).expect("get_mute should succeed on a live handle"), "starts unmuted");

    api::set_mute(handle, true).expect("set_mute should succeed on a live handle");
    assert!(api::get_mute(handle).unwrap());
    assert!(observer.events().contains(&RecordedEvent::Mute(true)));

    api::set_mute(handle, false).expect("set_mute should succeed on a live handle");
    assert!(!api::get_mute(handle).unwrap());
    assert!(observer.events().contains(&RecordedEvent::Mute(false)));
}

#[test]
fn ninth_turnserver_overflows_with_list_left_bounded() {
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(RecordingObserver::default()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );
    let convid = "conv-overflow".to_string();
    api::start(handle, convid.clone(), ConversationType::OneOnOne, CallMediaType::Normal, false).unwrap();

    for n in 0..8 {
        api::add_turnserver(handle, convid.clone(), turnserver(n)).expect("first 8 servers should be accepted");
    }
    let ninth = api::add_turnserver(handle, convid.clone(), turnserver(8));
    assert!(ninth.is_err(), "a 9th turn server must be refused (EOVERFLOW)");
}

#[test]
fn answer_without_a_pending_incoming_call_is_refused() {
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(RecordingObserver::default()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );
    // No call has ever been allocated for this convid.
    let result = api::answer(handle, "never-started".into(), CallMediaType::Normal, false);
    assert!(result.is_err());
}

#[test]
fn double_start_on_the_same_convid_is_already_exists() {
    let handle = api::create(
        "alice".into(),
        "a1".into(),
        Default::default(),
        Box::new(RecordingObserver::default()),
        Box::new(SimTransport::default()),
        Arc::new(SimFlowFactory::default()),
    );
    let convid = "conv-dup".to_string();
    api::start(handle, convid.clone(), ConversationType::OneOnOne, CallMediaType::Normal, false).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || api::get_state(handle, convid.clone())
            .map(|s| s == CallState::Outgoing)
            .unwrap_or(false)),
        "call never reached PENDING_OUTGOING after candidate gathering completed"
    );
    let second = api::start(handle, convid, ConversationType::OneOnOne, CallMediaType::Normal, false);
    assert!(second.is_err(), "starting twice on a convid already PENDING_OUTGOING must be refused");
}
