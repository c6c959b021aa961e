//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! CallManager: the per-user registry and dispatcher (spec.md §4.4,
//! "the wcall layer"). Owns every [`Call`] for one (userid, clientid)
//! identity, demultiplexes inbound messages by conversation id, maps
//! [`CallEffect`]s onto the [`Transport`]/[`Observer`] boundary, and
//! drives the per-call timer wheel. Everything here runs on a single
//! thread (spec.md §5); the handle validation and cross-thread
//! marshaling live one layer up, in `src/runtime.rs` and `src/api.rs`.

use std::collections::HashMap;
use std::time::Duration;

use crate::common::{
    same_user, CallDirection, CallMediaType, CallState, ConversationId, ConversationType,
    Result, UserId, VideoState,
};
use crate::config::CallManagerConfig;
use crate::core::call::{Call, CallEffect, CallEventSink, FlowEvent, TimerScope};
use crate::core::connection::{self, ConnectionState};
use crate::core::signaling::{Message, Payload, Transport as PreferredTransport};
use crate::core::timers::TimerWheel;
use crate::error::CallError;
use crate::flow::MediaFlowFactory;
use crate::observer::{Observer, ObserverEvent};
use crate::transport::{SendContext, Transport};
use std::sync::Arc;

const ALL_TIMER_SCOPES: [TimerScope; 6] = [
    TimerScope::Setup,
    TimerScope::Term,
    TimerScope::MediaStart,
    TimerScope::Quality,
    TimerScope::DcClose,
    TimerScope::Update,
];

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether `payload`/`is_response` is a message type allowed to
/// allocate a fresh call when no WCall exists yet for its convid
/// (spec.md §4.4 "Message demultiplexing", step 1).
fn is_allocation_trigger(payload: &Payload, is_response: bool) -> bool {
    matches!(
        (payload, is_response),
        (Payload::Setup { .. }, false)
            | (Payload::GroupStart, false)
            | (Payload::GroupCheck, true)
            | (Payload::ConfStart { .. }, false)
    )
}

fn conv_type_for_allocation(payload: &Payload) -> ConversationType {
    match payload {
        Payload::GroupStart | Payload::GroupCheck => ConversationType::Group,
        Payload::ConfStart { .. } => ConversationType::Conference,
        _ => ConversationType::OneOnOne,
    }
}

pub struct CallManager {
    self_userid: UserId,
    self_clientid: crate::common::ClientId,
    config: CallManagerConfig,
    calls: HashMap<ConversationId, Call>,
    call_states: HashMap<ConversationId, CallState>,
    observer: Box<dyn Observer>,
    transport: Box<dyn Transport>,
    flow_factory: Arc<dyn MediaFlowFactory>,
    event_sink: Arc<dyn CallEventSink>,
    timers: TimerWheel<(ConversationId, TimerScope)>,
    pending_sends: HashMap<SendContext, ConversationId>,
    next_ctx: SendContext,
    mute_state: bool,
}

impl CallManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_userid: UserId,
        self_clientid: crate::common::ClientId,
        config: CallManagerConfig,
        mut observer: Box<dyn Observer>,
        transport: Box<dyn Transport>,
        flow_factory: Arc<dyn MediaFlowFactory>,
        event_sink: Arc<dyn CallEventSink>,
    ) -> Self {
        observer.ready(env!("CARGO_PKG_VERSION"));
        CallManager {
            self_userid,
            self_clientid,
            config,
            calls: HashMap::new(),
            call_states: HashMap::new(),
            observer,
            transport,
            flow_factory,
            event_sink,
            timers: TimerWheel::new(),
            pending_sends: HashMap::new(),
            next_ctx: 0,
            mute_state: false,
        }
    }

    // ---- public operations (spec.md §4.4) ----------------------------

    pub fn start(
        &mut self,
        convid: &ConversationId,
        conv_type: ConversationType,
        call_type: CallMediaType,
        cbr: bool,
    ) -> Result<()> {
        if !self.calls.contains_key(convid) {
            self.allocate(convid.clone(), conv_type, CallDirection::Outgoing);
        }
        let effects = self.call_mut(convid)?.start(call_type, cbr)?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn answer(&mut self, convid: &ConversationId, call_type: CallMediaType, cbr: bool) -> Result<()> {
        let effects = self.call_mut(convid)?.answer(call_type, cbr)?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn end(&mut self, convid: &ConversationId) -> Result<()> {
        let effects = self.call_mut(convid)?.end();
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn reject(&mut self, convid: &ConversationId) -> Result<()> {
        let effects = self.call_mut(convid)?.reject()?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn restart(&mut self, convid: &ConversationId, call_type: CallMediaType) -> Result<()> {
        let effects = self.call_mut(convid)?.restart(call_type)?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn add_turnserver(&mut self, convid: &ConversationId, server: crate::flow::TurnServer) -> Result<()> {
        self.call_mut(convid)?.add_turnserver(server)
    }

    pub fn set_video_send_state(&mut self, convid: &ConversationId, vstate: VideoState) -> Result<()> {
        let effects = self.call_mut(convid)?.set_video_send_state(vstate)?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn set_local_audio_cbr(&mut self, convid: &ConversationId, enabled: bool) -> Result<()> {
        let effects = self.call_mut(convid)?.set_local_audio_cbr(enabled)?;
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
        Ok(())
    }

    pub fn media_start(&mut self, convid: &ConversationId) -> Result<()> {
        let effects = self.call_mut(convid)?.media_start();
        self.flush(convid, effects);
        Ok(())
    }

    pub fn media_stop(&mut self, convid: &ConversationId) -> Result<()> {
        let effects = self.call_mut(convid)?.media_stop();
        self.flush(convid, effects);
        Ok(())
    }

    pub fn set_quality_interval(&mut self, convid: &ConversationId, ms: u32) -> Result<()> {
        let effects = self.call_mut(convid)?.set_quality_interval(ms);
        self.flush(convid, effects);
        Ok(())
    }

    pub fn get_state(&self, convid: &ConversationId) -> CallState {
        if !self.calls.contains_key(convid) {
            return CallState::Unknown;
        }
        self.call_states.get(convid).copied().unwrap_or(CallState::None)
    }

    pub fn iterate_state(&self, mut f: impl FnMut(&ConversationId, CallState)) {
        for convid in self.calls.keys() {
            f(convid, self.call_states.get(convid).copied().unwrap_or(CallState::None));
        }
    }

    /// Returns the directly-signaling peer for `convid`, if any. Group
    /// membership beyond that peer is out of scope: roster management
    /// for group/conference calls is owned by the SFT/backend, never
    /// by this crate (spec.md §1).
    pub fn get_members(&self, convid: &ConversationId) -> Result<Vec<(UserId, crate::common::ClientId)>> {
        let call = self
            .calls
            .get(convid)
            .ok_or_else(|| CallError::not_found("no such call"))?;
        let peer_user = call.peer_userid();
        if peer_user.is_empty() {
            Ok(vec![])
        } else {
            Ok(vec![(peer_user, call.peer_clientid())])
        }
    }

    /// Sets the instance-wide mute flag and notifies the observer
    /// (spec.md §3 "Instance holds ... mute state", §6 `mute(muted)`).
    /// Dispatched directly rather than through a per-call
    /// [`CallEffect`]: unlike every other `ObserverEvent`, mute state
    /// belongs to the instance, not a conversation, so there is no
    /// `convid` to queue it against — the same reasoning that already
    /// has `ready`/`shutdown` call the observer directly instead of
    /// going through `flush`.
    pub fn set_mute(&mut self, muted: bool) {
        self.mute_state = muted;
        self.observer.mute(muted);
    }

    pub fn get_mute(&self) -> bool {
        self.mute_state
    }

    pub fn shutdown(&mut self) {
        let convids: Vec<ConversationId> = self.calls.keys().cloned().collect();
        for convid in convids {
            if let Some(call) = self.calls.get_mut(&convid) {
                let effects = call.end();
                self.flush(&convid, effects);
            }
            self.calls.remove(&convid);
            for scope in ALL_TIMER_SCOPES {
                self.timers.cancel(&(convid.clone(), scope));
            }
        }
        self.observer.shutdown();
    }

    /// The application's confirmation that a prior [`Transport::send`]
    /// either succeeded or failed (spec.md §6 `resp(ctx, status,
    /// reason)`). An unrecognized `ctx` is logged and dropped.
    pub fn resp(&mut self, ctx: SendContext, status: i32, reason: &str) {
        match self.pending_sends.remove(&ctx) {
            Some(convid) if status != 0 => {
                log::warn!("convid={convid}: send ctx={ctx} failed: status={status} reason={reason}");
            }
            Some(convid) => log::trace!("convid={convid}: send ctx={ctx} delivered"),
            None => log::warn!("resp: unknown send context {ctx} (status={status}, reason={reason})"),
        }
    }

    // ---- message demultiplexing (spec.md §4.4) ------------------------

    pub fn recv_msg(
        &mut self,
        convid: ConversationId,
        curr_time: u64,
        msg_time: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let decoded = Message::decode(curr_time, msg_time, bytes)?;
        let message = decoded.message;
        log::debug!("convid={convid}: recv {}", message.brief());

        if self.calls.contains_key(&convid) {
            return self.recv_for_existing_call(convid, msg_time, message);
        }

        if is_allocation_trigger(&message.payload, message.is_response)
            && connection::is_remote_creator(
                &self.self_userid,
                &self.self_clientid,
                &message.src_userid,
                &message.src_clientid,
            )
        {
            let conv_type = conv_type_for_allocation(&message.payload);
            self.allocate(convid.clone(), conv_type, CallDirection::Incoming);
            let effects = self.call_mut(&convid)?.msg_recv(msg_time, message)?;
            self.flush(&convid, effects);
            self.cleanup_if_terminating(&convid);
            return Ok(());
        }

        if same_user(&message.src_userid, &self.self_userid)
            && message.age >= self.config.setup_timeout.as_secs()
        {
            let video = message
                .payload
                .props()
                .map(|p| matches!(p.derive_video_state(), VideoState::Started | VideoState::ScreenShare))
                .unwrap_or(false);
            self.observer.missed(&convid, msg_time, &message.src_userid, video);
            return Ok(());
        }

        log::warn!(
            "convid={convid}: dropping {} with no matching call (EPROTO)",
            message.brief()
        );
        Err(CallError::Protocol(format!("no call for convid {convid}")))
    }

    /// Routes a message for a convid that already has a [`Call`].
    /// Handles the same-user-other-device special case (spec.md §4.4
    /// step 2) before falling through to the normal `msg_recv` path.
    fn recv_for_existing_call(
        &mut self,
        convid: ConversationId,
        msg_time: u64,
        message: Message,
    ) -> Result<()> {
        let (conv_type, state) = {
            let call = self.calls.get(&convid).expect("checked by caller");
            (call.conv_type, call.state())
        };
        let is_same_user_oneonone =
            same_user(&message.src_userid, &self.self_userid) && conv_type == ConversationType::OneOnOne;

        if is_same_user_oneonone {
            let is_other_device_answer = matches!(message.payload, Payload::Setup { .. } if message.is_response);
            let is_other_device_reject = matches!(message.payload, Payload::Reject);
            if state == ConnectionState::PendingOutgoing && (is_other_device_answer || is_other_device_reject) {
                let effects = self
                    .call_mut(&convid)?
                    .close_for_other_device(is_other_device_reject);
                self.flush(&convid, effects);
                self.cleanup_if_terminating(&convid);
            } else {
                log::debug!(
                    "convid={convid}: ignoring same-user message {} in state {state:?}",
                    message.brief()
                );
            }
            return Ok(());
        }

        let effects = self.call_mut(&convid)?.msg_recv(msg_time, message)?;
        self.flush(&convid, effects);
        self.cleanup_if_terminating(&convid);
        Ok(())
    }

    // ---- timer wheel (spec.md §5) --------------------------------------

    pub fn next_timer_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline_in()
    }

    pub fn poll_timers(&mut self) {
        for (convid, scope) in self.timers.poll_expired() {
            self.fire_timer(&convid, scope);
        }
    }

    fn fire_timer(&mut self, convid: &ConversationId, scope: TimerScope) {
        let effects = match self.calls.get_mut(convid) {
            Some(call) => match scope {
                TimerScope::Setup => call.timer_setup_fired(),
                TimerScope::Term => call.timer_term_fired(),
                TimerScope::MediaStart => call.timer_media_start_fired(),
                TimerScope::DcClose => call.timer_dc_close_fired(),
                TimerScope::Update => call.timer_update_fired(),
                TimerScope::Quality => call.timer_quality_fired(),
            },
            None => return,
        };
        self.flush(convid, effects);
        self.cleanup_if_terminating(convid);
    }

    // ---- flow callback re-entry (bridged via CallEventSink) -----------

    /// Invoked by the runtime's [`CallEventSink`] implementation once a
    /// [`FlowEvent`] has been marshaled back onto this thread (spec.md
    /// §5 "responses... execute on the core thread").
    pub(crate) fn dispatch_flow_event(&mut self, convid: ConversationId, event: FlowEvent) {
        let effects = match self.calls.get_mut(&convid) {
            Some(call) => match event {
                FlowEvent::Estab => call.on_flow_estab(),
                FlowEvent::Close(err) => call.on_flow_error(err),
                FlowEvent::Stopped => call.on_flow_stopped(),
                FlowEvent::RtpStart => call.on_flow_rtp_start(),
                FlowEvent::RestartRequested => call.on_flow_restart_requested(),
                FlowEvent::GatherComplete => call.on_gather_complete(),
                FlowEvent::ChannelEstab => call.on_channel_estab(),
                FlowEvent::ChannelClose => call.on_channel_close(),
                FlowEvent::DceRecv(bytes) => match call.on_dce_recv(bytes) {
                    Ok(effects) => effects,
                    Err(e) => {
                        log::warn!("convid={convid}: failed to decode in-band message: {e}");
                        return;
                    }
                },
            },
            None => {
                log::debug!("convid={convid}: flow event for unknown call, dropping");
                return;
            }
        };
        self.flush(&convid, effects);
        self.cleanup_if_terminating(&convid);
    }

    // ---- internals ------------------------------------------------------

    fn allocate(&mut self, convid: ConversationId, conv_type: ConversationType, direction: CallDirection) {
        let max_retries = self.config.max_retries(conv_type);
        let call = Call::new(
            convid.clone(),
            conv_type,
            CallMediaType::Normal,
            direction,
            self.self_userid.clone(),
            self.self_clientid.clone(),
            max_retries,
            self.config.timeouts(),
            self.config.max_sdp_len,
            self.flow_factory.clone(),
            self.event_sink.clone(),
        );
        self.calls.insert(convid, call);
    }

    fn call_mut(&mut self, convid: &ConversationId) -> Result<&mut Call> {
        self.calls
            .get_mut(convid)
            .ok_or_else(|| CallError::not_found(format!("no call for convid {convid}")))
    }

    fn cleanup_if_terminating(&mut self, convid: &ConversationId) {
        let terminating = self.calls.get(convid).map(Call::is_terminating).unwrap_or(false);
        if terminating {
            for scope in ALL_TIMER_SCOPES {
                self.timers.cancel(&(convid.clone(), scope));
            }
            self.calls.remove(convid);
            log::debug!("convid={convid}: call removed from registry");
        }
    }

    fn flush(&mut self, convid: &ConversationId, effects: Vec<CallEffect>) {
        for effect in effects {
            match effect {
                CallEffect::Send { payload, is_response } => self.send_effect(convid, payload, is_response),
                CallEffect::Observe(event) => {
                    if let ObserverEvent::State(state) = &event {
                        self.call_states.insert(convid.clone(), *state);
                    }
                    event.dispatch(convid, self.observer.as_mut());
                }
                CallEffect::ArmTimer { kind, duration } => self.timers.arm((convid.clone(), kind), duration),
                CallEffect::CancelTimer(kind) => self.timers.cancel(&(convid.clone(), kind)),
            }
        }
    }

    /// Routes a [`CallEffect::Send`]'s message to the data channel or the
    /// backend relay (spec.md §8 invariant 4: "Any send() whose message
    /// type routes to the data channel is only emitted while Econn >=
    /// DATACHAN_ESTABLISHED"; spec.md §4.3 "Data-channel in-band
    /// signaling": PROPSYNC and HANGUP travel over the channel once it
    /// is established, everything else always traverses the backend).
    fn send_effect(&mut self, convid: &ConversationId, payload: Payload, is_response: bool) {
        let (dest_userid, dest_clientid, dc_established) = match self.calls.get(convid) {
            Some(call) => {
                let u = call.peer_userid();
                let c = call.peer_clientid();
                (
                    if u.is_empty() { None } else { Some(u) },
                    if c.is_empty() { None } else { Some(c) },
                    call.data_channel_established(),
                )
            }
            None => (None, None, false),
        };
        let msg_type = payload.msg_type();
        let message = Message {
            src_userid: self.self_userid.clone(),
            src_clientid: self.self_clientid.clone(),
            dest_userid,
            dest_clientid,
            time: now_unix_secs(),
            age: 0,
            is_response,
            transient: matches!(payload, Payload::PropSync { .. }),
            payload,
            extra: serde_json::Map::new(),
        };
        let bytes = match message.encode() {
            Ok(s) => s.into_bytes(),
            Err(e) => {
                log::error!("convid={convid}: failed to encode {}: {e}", message.brief());
                return;
            }
        };

        let over_dc = dc_established
            && matches!(msg_type.preferred_transport(), PreferredTransport::DataChannel | PreferredTransport::Either);
        if over_dc {
            match self.calls.get_mut(convid).map(|call| call.dce_send(&bytes)) {
                Some(Ok(())) => return,
                Some(Err(e)) => {
                    log::warn!("convid={convid}: data-channel send failed, falling back to backend: {e}");
                }
                None => {}
            }
        }

        self.next_ctx += 1;
        let ctx = self.next_ctx;
        self.pending_sends.insert(ctx, convid.clone());
        let sent = self.transport.send(
            ctx,
            convid,
            &self.self_userid,
            &self.self_clientid,
            message.dest_userid.as_ref(),
            message.dest_clientid.as_ref(),
            &bytes,
            message.transient,
        );
        if let Err(e) = sent {
            log::warn!("convid={convid}: transport send failed: {e}");
            self.pending_sends.remove(&ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowCallbacks, FlowStats, MediaFlow, MediaFlowFactory, TurnServer};
    use std::sync::Mutex;

    struct NullSink;
    impl CallEventSink for NullSink {
        fn post(&self, _convid: ConversationId, _event: FlowEvent) {}
    }

    struct InstantFlow;
    impl MediaFlow for InstantFlow {
        fn set_callbacks(&mut self, _callbacks: Box<dyn FlowCallbacks>) {}
        fn add_turnserver(&mut self, _server: TurnServer) -> Result<()> {
            Ok(())
        }
        fn set_remote_userclientid(&mut self, _userid: &str, _clientid: &str) {}
        fn set_video_state(&mut self, _state: VideoState) {}
        fn gather_all_turn(&mut self, _is_offer: bool) {}
        fn is_gathered(&self) -> bool {
            true
        }
        fn handle_offer(&mut self, _sdp: &str) -> Result<()> {
            Ok(())
        }
        fn handle_answer(&mut self, _sdp: &str) -> Result<()> {
            Ok(())
        }
        fn generate_offer(&mut self) -> Result<String> {
            Ok("v=0 offer".into())
        }
        fn generate_answer(&mut self) -> Result<String> {
            Ok("v=0 answer".into())
        }
        fn dce_send(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        fn start_media(&mut self) {}
        fn stop_media(&mut self) {}
        fn close(&mut self) {}
        fn get_stats(&self) -> FlowStats {
            FlowStats::default()
        }
        fn set_audio_cbr(&mut self, _enabled: bool) {}
        fn get_audio_cbr(&self, _include_negotiated: bool) -> bool {
            false
        }
        fn enable_privacy(&mut self, _enabled: bool) {}
        fn set_e2ee_key(&mut self, _idx: u32, _key: [u8; 32]) {}
    }

    struct InstantFactory;
    impl MediaFlowFactory for InstantFactory {
        fn alloc(
            &self,
            _convid: &ConversationId,
            _conv_type: ConversationType,
            _call_type: CallMediaType,
            _vstate: VideoState,
        ) -> Result<Box<dyn MediaFlow>> {
            Ok(Box::new(InstantFlow))
        }
    }

    struct NullObserver;
    impl Observer for NullObserver {
        fn ready(&mut self, _version: &str) {}
        fn incoming(&mut self, _convid: &ConversationId, _msg_time: u64, _userid: &UserId, _video: bool, _should_ring: bool) {}
        fn missed(&mut self, _convid: &ConversationId, _msg_time: u64, _userid: &UserId, _video: bool) {}
        fn answered(&mut self, _convid: &ConversationId) {}
        fn estab(&mut self, _convid: &ConversationId, _userid: &UserId) {}
        fn close(&mut self, _reason: crate::common::CloseReason, _convid: &ConversationId, _msg_time: u64, _userid: &UserId) {}
        fn metrics(&mut self, _convid: &ConversationId, _json: &str) {}
        fn cfg_req(&mut self) {}
        fn state(&mut self, _convid: &ConversationId, _state: CallState) {}
        fn vstate(&mut self, _convid: &ConversationId, _userid: &UserId, _clientid: &crate::common::ClientId, _vstate: VideoState) {}
        fn acbr(&mut self, _userid: &UserId, _enabled: bool) {}
        fn media_estab(&mut self, _convid: &ConversationId, _userid: &UserId) {}
        fn media_stopped(&mut self, _convid: &ConversationId) {}
        fn dc_estab(&mut self, _convid: &ConversationId, _userid: &UserId) {}
        fn group_changed(&mut self, _convid: &ConversationId) {}
        fn participant_changed_json(&mut self, _convid: &ConversationId, _json: &str) {}
        fn req_clients(&mut self, _convid: &ConversationId) {}
        fn mute(&mut self, _muted: bool) {}
        fn network_quality(
            &mut self,
            _convid: &ConversationId,
            _userid: &UserId,
            _quality: crate::common::NetworkQuality,
            _rtt_ms: u32,
            _uplink_loss_pct: u32,
            _downlink_loss_pct: u32,
        ) {
        }
        fn shutdown(&mut self) {}
        fn log(&mut self, _level: log::Level, _msg: &str) {}
    }

    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
    }
    impl Transport for RecordingTransport {
        fn send(
            &mut self,
            _ctx: SendContext,
            convid: &ConversationId,
            _self_userid: &UserId,
            _self_clientid: &crate::common::ClientId,
            _dest_userid: Option<&UserId>,
            _dest_clientid: Option<&crate::common::ClientId>,
            bytes: &[u8],
            _transient: bool,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(format!("{convid}:{}", String::from_utf8_lossy(bytes)));
            Ok(())
        }
    }

    fn manager() -> CallManager {
        CallManager::new(
            "alice".into(),
            "a1".into(),
            CallManagerConfig::default(),
            Box::new(NullObserver),
            Box::new(RecordingTransport { sent: Mutex::new(Vec::new()) }),
            Arc::new(InstantFactory),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn start_allocates_and_sends_setup() {
        let mut mgr = manager();
        let convid: ConversationId = "c1".into();
        mgr.start(&convid, ConversationType::OneOnOne, CallMediaType::Normal, false)
            .unwrap();
        assert_eq!(mgr.get_state(&convid), CallState::Outgoing);
    }

    #[test]
    fn unsolicited_message_with_no_call_is_dropped_with_protocol_error() {
        let mut mgr = manager();
        let msg = Message {
            src_userid: "mallory".into(),
            src_clientid: "m1".into(),
            dest_userid: None,
            dest_clientid: None,
            time: 0,
            age: 0,
            is_response: true,
            transient: false,
            payload: Payload::Update {
                sdp: "v=0".into(),
                props: crate::core::properties::PropertySet::new(),
            },
            extra: serde_json::Map::new(),
        };
        let bytes = msg.encode().unwrap().into_bytes();
        let result = mgr.recv_msg("c2".into(), 0, 0, &bytes);
        assert!(matches!(result, Err(CallError::Protocol(_))));
    }

    #[test]
    fn creator_role_setup_allocates_incoming_call() {
        let mut mgr = manager();
        let mut props = crate::core::properties::PropertySet::new();
        props.set("videosend", "true");
        let msg = Message {
            src_userid: "aaron".into(),
            src_clientid: "x1".into(),
            dest_userid: None,
            dest_clientid: None,
            time: 0,
            age: 0,
            is_response: false,
            transient: false,
            payload: Payload::Setup {
                sdp: "v=0".into(),
                props,
                reset: false,
            },
            extra: serde_json::Map::new(),
        };
        let bytes = msg.encode().unwrap().into_bytes();
        mgr.recv_msg("c3".into(), 0, 0, &bytes).unwrap();
        assert_eq!(mgr.get_state(&"c3".to_string()), CallState::Incoming);
    }

    #[test]
    fn same_user_setup_resp_while_pending_outgoing_closes_with_answered_elsewhere() {
        let mut mgr = manager();
        let convid: ConversationId = "c4".into();
        mgr.start(&convid, ConversationType::OneOnOne, CallMediaType::Normal, false)
            .unwrap();
        let msg = Message {
            src_userid: "alice".into(),
            src_clientid: "a2".into(),
            dest_userid: None,
            dest_clientid: None,
            time: 0,
            age: 0,
            is_response: true,
            transient: false,
            payload: Payload::Setup {
                sdp: "v=0".into(),
                props: crate::core::properties::PropertySet::new(),
                reset: false,
            },
            extra: serde_json::Map::new(),
        };
        let bytes = msg.encode().unwrap().into_bytes();
        mgr.recv_msg(convid.clone(), 0, 0, &bytes).unwrap();
        assert_eq!(mgr.get_state(&convid), CallState::Unknown);
    }
}
