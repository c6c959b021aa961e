//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! In-memory test doubles for the [`flow::MediaFlow`](crate::flow::MediaFlow),
//! [`transport::Transport`](crate::transport::Transport) and
//! [`observer::Observer`](crate::observer::Observer) traits, mirroring
//! the teacher's own `sim::sim_platform` split: one fake per trait
//! boundary, wired together by whatever scenario test needs them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::common::{CallMediaType, CallState, ClientId, CloseReason, ConversationId, ConversationType, NetworkQuality, Result, UserId, VideoState};
use crate::error::CallError;
use crate::flow::{FlowCallbacks, FlowStats, MediaFlow, MediaFlowFactory, TurnServer};
use crate::observer::Observer;
use crate::transport::{SendContext, Transport};

/// A fault a [`SimFlow`] should inject the next time it would
/// otherwise succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFault {
    None,
    Eio,
    ETimedOut,
}

struct SimFlowShared {
    gathered: bool,
    turnservers: Vec<TurnServer>,
    audio_cbr: bool,
    fault: SimFault,
}

/// An in-memory [`MediaFlow`]. Gather completion is synchronous unless
/// [`SimFlow::delay_gather`] was set, in which case the caller must
/// invoke [`SimFlow::complete_gather`] itself to simulate the extra
/// marshal round-trip a real ICE gatherer needs.
pub struct SimFlow {
    shared: Arc<Mutex<SimFlowShared>>,
    callbacks: Option<Box<dyn FlowCallbacks>>,
    delay_gather: bool,
    dce_log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SimFlow {
    pub fn new(fault: SimFault, delay_gather: bool) -> Self {
        SimFlow {
            shared: Arc::new(Mutex::new(SimFlowShared {
                gathered: false,
                turnservers: Vec::new(),
                audio_cbr: false,
                fault,
            })),
            callbacks: None,
            delay_gather,
            dce_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Like [`SimFlow::new`], but records every [`MediaFlow::dce_send`]
    /// payload into `dce_log` instead of a private one only this
    /// instance can read back.
    fn with_dce_log(fault: SimFault, delay_gather: bool, dce_log: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
        SimFlow { dce_log, ..SimFlow::new(fault, delay_gather) }
    }

    /// Fires the deferred `on_gather_complete` callback for a flow
    /// constructed with `delay_gather = true`.
    pub fn complete_gather(&mut self) {
        self.shared.lock().expect("sim flow mutex poisoned").gathered = true;
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_gather_complete();
        }
    }
}

impl MediaFlow for SimFlow {
    fn set_callbacks(&mut self, callbacks: Box<dyn FlowCallbacks>) {
        self.callbacks = Some(callbacks);
    }

    fn add_turnserver(&mut self, server: TurnServer) -> Result<()> {
        self.shared.lock().expect("sim flow mutex poisoned").turnservers.push(server);
        Ok(())
    }

    fn set_remote_userclientid(&mut self, _userid: &str, _clientid: &str) {}

    fn set_video_state(&mut self, _state: VideoState) {}

    fn gather_all_turn(&mut self, _is_offer: bool) {
        if self.delay_gather {
            return;
        }
        self.shared.lock().expect("sim flow mutex poisoned").gathered = true;
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_gather_complete();
        }
    }

    fn is_gathered(&self) -> bool {
        self.shared.lock().expect("sim flow mutex poisoned").gathered
    }

    fn handle_offer(&mut self, _sdp: &str) -> Result<()> {
        self.fault_as_result()
    }

    /// Succeeds and, like a real flow reaching DTLS/ICE completion
    /// moments after the SDP exchange finishes, immediately signals
    /// that the data channel is up (the offerer's side of reaching
    /// `ConnectionState::Answered`).
    fn handle_answer(&mut self, _sdp: &str) -> Result<()> {
        self.fault_as_result()?;
        self.signal_channel_estab();
        Ok(())
    }

    fn generate_offer(&mut self) -> Result<String> {
        self.fault_as_result().map(|_| "v=0\r\no=- sim 0 IN IP4 0.0.0.0\r\n".to_string())
    }

    /// Succeeds and signals data-channel establishment, the answerer's
    /// side of the same moment `handle_answer` signals for the offerer.
    fn generate_answer(&mut self) -> Result<String> {
        self.fault_as_result()?;
        self.signal_channel_estab();
        Ok("v=0\r\no=- sim 1 IN IP4 0.0.0.0\r\n".to_string())
    }

    fn dce_send(&mut self, bytes: &[u8]) -> Result<()> {
        self.dce_log.lock().expect("sim flow mutex poisoned").push(bytes.to_vec());
        Ok(())
    }

    fn start_media(&mut self) {}

    fn stop_media(&mut self) {}

    fn close(&mut self) {}

    fn get_stats(&self) -> FlowStats {
        FlowStats::default()
    }

    fn set_audio_cbr(&mut self, enabled: bool) {
        self.shared.lock().expect("sim flow mutex poisoned").audio_cbr = enabled;
    }

    fn get_audio_cbr(&self, _include_negotiated: bool) -> bool {
        self.shared.lock().expect("sim flow mutex poisoned").audio_cbr
    }

    fn enable_privacy(&mut self, _enabled: bool) {}

    fn set_e2ee_key(&mut self, _idx: u32, _key: [u8; 32]) {}
}

impl SimFlow {
    fn fault_as_result(&self) -> Result<()> {
        match self.shared.lock().expect("sim flow mutex poisoned").fault {
            SimFault::None => Ok(()),
            SimFault::Eio => Err(CallError::Io("simulated media flow fault".into())),
            SimFault::ETimedOut => Err(CallError::TimedOut),
        }
    }

    fn signal_channel_estab(&mut self) {
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_channel_estab();
        }
    }
}

/// Builds [`SimFlow`]s with a fixed fault/delay configuration for an
/// entire test. Tests that need per-call variation construct
/// [`SimFlow`] directly instead of going through a factory. Every flow
/// the factory allocates shares the same `dce_send` log, so a test can
/// assert on in-band traffic without holding a reference to whichever
/// flow instance `Call` happened to allocate (including across a
/// restart, which swaps in a fresh flow).
pub struct SimFlowFactory {
    pub fault: SimFault,
    pub delay_gather: bool,
    dce_log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for SimFlowFactory {
    fn default() -> Self {
        SimFlowFactory {
            fault: SimFault::None,
            delay_gather: false,
            dce_log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SimFlowFactory {
    /// Every payload sent over the data channel by any flow this
    /// factory has allocated so far.
    pub fn dce_sent(&self) -> Vec<Vec<u8>> {
        self.dce_log.lock().expect("sim flow mutex poisoned").clone()
    }
}

impl MediaFlowFactory for SimFlowFactory {
    fn alloc(
        &self,
        _convid: &ConversationId,
        _conv_type: ConversationType,
        _call_type: CallMediaType,
        _vstate: VideoState,
    ) -> Result<Box<dyn MediaFlow>> {
        Ok(Box::new(SimFlow::with_dce_log(self.fault, self.delay_gather, self.dce_log.clone())))
    }
}

/// An in-memory [`Transport`] that feeds the bytes it's asked to send
/// straight into a paired peer's `recv_msg`, rather than actually
/// crossing a network. Wire a pair of `SimTransport`s (one per side)
/// with [`SimTransport::set_peer`] for two-sided scenario tests.
pub struct SimTransport {
    peer: Mutex<Option<std::sync::mpsc::Sender<(ConversationId, Vec<u8>)>>>,
    drop_all: Mutex<bool>,
    sent: Mutex<VecDeque<(ConversationId, Vec<u8>)>>,
    send_count: std::sync::atomic::AtomicU64,
}

impl Default for SimTransport {
    fn default() -> Self {
        SimTransport {
            peer: Mutex::new(None),
            drop_all: Mutex::new(false),
            sent: Mutex::new(VecDeque::new()),
            send_count: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl SimTransport {
    /// Routes every sent message into `sink`, typically the other
    /// side's `Marshal::submit(recv_msg(...))` closure.
    pub fn set_peer(&self, sink: std::sync::mpsc::Sender<(ConversationId, Vec<u8>)>) {
        *self.peer.lock().expect("sim transport mutex poisoned") = Some(sink);
    }

    pub fn set_drop_all(&self, drop_all: bool) {
        *self.drop_all.lock().expect("sim transport mutex poisoned") = drop_all;
    }

    /// Drains whatever was queued by `send` while no peer was wired up.
    pub fn take_sent(&self) -> Vec<(ConversationId, Vec<u8>)> {
        self.sent.lock().expect("sim transport mutex poisoned").drain(..).collect()
    }

    /// Total number of `Transport::send` calls so far, regardless of
    /// whether a peer was wired up to receive them. Useful for
    /// asserting a message stayed off the backend entirely (e.g. once
    /// it routes over the data channel instead).
    pub fn send_count(&self) -> u64 {
        self.send_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Transport for SimTransport {
    fn send(
        &mut self,
        _ctx: SendContext,
        convid: &ConversationId,
        _self_userid: &UserId,
        _self_clientid: &ClientId,
        _dest_userid: Option<&UserId>,
        _dest_clientid: Option<&ClientId>,
        bytes: &[u8],
        _transient: bool,
    ) -> Result<()> {
        self.send_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if *self.drop_all.lock().expect("sim transport mutex poisoned") {
            return Ok(());
        }
        match self.peer.lock().expect("sim transport mutex poisoned").as_ref() {
            Some(sink) => {
                let _ = sink.send((convid.clone(), bytes.to_vec()));
            }
            None => {
                self.sent.lock().expect("sim transport mutex poisoned").push_back((convid.clone(), bytes.to_vec()));
            }
        }
        Ok(())
    }
}

/// One recorded [`Observer`] callback invocation, flattened for easy
/// assertions (`calls.iter().any(|e| matches!(e, ..))`).
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedEvent {
    Ready(String),
    Incoming { convid: ConversationId, userid: UserId, video: bool, should_ring: bool },
    Missed { convid: ConversationId, userid: UserId, video: bool },
    Answered { convid: ConversationId },
    Estab { convid: ConversationId, userid: UserId },
    Close { reason: CloseReason, convid: ConversationId, userid: UserId },
    State { convid: ConversationId, state: CallState },
    VState { convid: ConversationId, userid: UserId, vstate: VideoState },
    Acbr { userid: UserId, enabled: bool },
    MediaEstab { convid: ConversationId, userid: UserId },
    MediaStopped { convid: ConversationId },
    DcEstab { convid: ConversationId, userid: UserId },
    CfgReq,
    NetworkQuality { convid: ConversationId, userid: UserId, quality: NetworkQuality },
    Mute(bool),
    Shutdown,
}

/// An [`Observer`] that appends every invocation to a shared log
/// instead of acting on it, for scenario-test assertions.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("recording observer mutex poisoned").clone()
    }

    fn push(&self, event: RecordedEvent) {
        self.events.lock().expect("recording observer mutex poisoned").push(event);
    }
}

impl Observer for RecordingObserver {
    fn ready(&mut self, version: &str) {
        self.push(RecordedEvent::Ready(version.to_string()));
    }

    fn incoming(&mut self, convid: &ConversationId, _msg_time: u64, userid: &UserId, video: bool, should_ring: bool) {
        self.push(RecordedEvent::Incoming { convid: convid.clone(), userid: userid.clone(), video, should_ring });
    }

    fn missed(&mut self, convid: &ConversationId, _msg_time: u64, userid: &UserId, video: bool) {
        self.push(RecordedEvent::Missed { convid: convid.clone(), userid: userid.clone(), video });
    }

    fn answered(&mut self, convid: &ConversationId) {
        self.push(RecordedEvent::Answered { convid: convid.clone() });
    }

    fn estab(&mut self, convid: &ConversationId, userid: &UserId) {
        self.push(RecordedEvent::Estab { convid: convid.clone(), userid: userid.clone() });
    }

    fn close(&mut self, reason: CloseReason, convid: &ConversationId, _msg_time: u64, userid: &UserId) {
        self.push(RecordedEvent::Close { reason, convid: convid.clone(), userid: userid.clone() });
    }

    fn metrics(&mut self, _convid: &ConversationId, _json: &str) {}

    fn cfg_req(&mut self) {
        self.push(RecordedEvent::CfgReq);
    }

    fn state(&mut self, convid: &ConversationId, state: CallState) {
        self.push(RecordedEvent::State { convid: convid.clone(), state });
    }

    fn vstate(&mut self, convid: &ConversationId, userid: &UserId, _clientid: &ClientId, vstate: VideoState) {
        self.push(RecordedEvent::VState { convid: convid.clone(), userid: userid.clone(), vstate });
    }

    fn acbr(&mut self, userid: &UserId, enabled: bool) {
        self.push(RecordedEvent::Acbr { userid: userid.clone(), enabled });
    }

    fn media_estab(&mut self, convid: &ConversationId, userid: &UserId) {
        self.push(RecordedEvent::MediaEstab { convid: convid.clone(), userid: userid.clone() });
    }

    fn media_stopped(&mut self, convid: &ConversationId) {
        self.push(RecordedEvent::MediaStopped { convid: convid.clone() });
    }

    fn dc_estab(&mut self, convid: &ConversationId, userid: &UserId) {
        self.push(RecordedEvent::DcEstab { convid: convid.clone(), userid: userid.clone() });
    }

    fn group_changed(&mut self, _convid: &ConversationId) {}

    fn participant_changed_json(&mut self, _convid: &ConversationId, _json: &str) {}

    fn req_clients(&mut self, _convid: &ConversationId) {}

    fn mute(&mut self, muted: bool) {
        self.push(RecordedEvent::Mute(muted));
    }

    fn network_quality(
        &mut self,
        convid: &ConversationId,
        userid: &UserId,
        quality: NetworkQuality,
        _rtt_ms: u32,
        _uplink_loss_pct: u32,
        _downlink_loss_pct: u32,
    ) {
        self.push(RecordedEvent::NetworkQuality { convid: convid.clone(), userid: userid.clone(), quality });
    }

    fn shutdown(&mut self) {
        self.push(RecordedEvent::Shutdown);
    }

    fn log(&mut self, level: log::Level, msg: &str) {
        log::log!(level, "observer: {msg}");
    }
}
