//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call: the per-call controller (spec.md §4.3, "ecall"). Binds a
//! [`Connection`] to a [`MediaFlow`], serializes SDP generation against
//! asynchronous candidate gathering, derives video/CBR state from
//! property sets, and drives restart/recovery. Like `Connection`,
//! every public method is a total function returning the
//! [`CallEffect`]s its owner ([`crate::core::manager::CallManager`])
//! must carry out; `Call` never touches a [`crate::transport::Transport`]
//! or [`crate::observer::Observer`] directly.

use std::sync::Arc;
use std::time::Duration;

use crate::common::{
    CallDirection, CallMediaType, CallState, ClientId, CloseReason, ConversationId,
    ConversationType, NetworkQuality, Result, UserId, VideoState,
};
use crate::core::connection::{self, Connection, ConnectionState, Role};
use crate::core::properties::{self, PropertySet};
use crate::core::signaling::Payload;
use crate::error::CallError;
use crate::flow::{MediaFlow, MediaFlowFactory, TurnServer};
use crate::observer::ObserverEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
enum GatherPhase {
    None,
    Offer,
    Answer,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum TimerScope {
    Setup,
    Term,
    MediaStart,
    Quality,
    DcClose,
    Update,
}

impl From<connection::TimerKind> for TimerScope {
    fn from(kind: connection::TimerKind) -> Self {
        match kind {
            connection::TimerKind::Setup => TimerScope::Setup,
            connection::TimerKind::Term => TimerScope::Term,
        }
    }
}

/// Work a `Call` transition hands back to its owner (spec.md §9
/// "effects are queued; the runtime flushes them").
pub enum CallEffect {
    Send { payload: Payload, is_response: bool },
    Observe(ObserverEvent),
    ArmTimer { kind: TimerScope, duration: Duration },
    CancelTimer(TimerScope),
}

/// A media-flow callback re-expressed as data (spec.md §5 "responses
/// ... execute on the core thread"). Flow callbacks may originate on a
/// foreign (media engine) thread; they are never handled inline, only
/// posted through a [`CallEventSink`] and drained by the marshal.
pub enum FlowEvent {
    Estab,
    Close(CallError),
    Stopped,
    RtpStart,
    RestartRequested,
    GatherComplete,
    ChannelEstab,
    ChannelClose,
    DceRecv(Vec<u8>),
}

/// Bridges [`crate::flow::FlowCallbacks`] back onto the core thread's
/// marshal. Implemented by [`crate::core::manager::CallManager`]'s
/// runtime wiring (and by the test-only `sim` harness).
pub trait CallEventSink: Send + Sync {
    fn post(&self, convid: ConversationId, event: FlowEvent);
}

struct MarshalFlowCallbacks {
    convid: ConversationId,
    sink: Arc<dyn CallEventSink>,
}

impl crate::flow::FlowCallbacks for MarshalFlowCallbacks {
    fn on_estab(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::Estab);
    }
    fn on_close(&mut self, err: CallError) {
        self.sink.post(self.convid.clone(), FlowEvent::Close(err));
    }
    fn on_stopped(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::Stopped);
    }
    fn on_rtp_start(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::RtpStart);
    }
    fn on_restart(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::RestartRequested);
    }
    fn on_gather_complete(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::GatherComplete);
    }
    fn on_channel_estab(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::ChannelEstab);
    }
    fn on_dce_recv(&mut self, bytes: Vec<u8>) {
        self.sink.post(self.convid.clone(), FlowEvent::DceRecv(bytes));
    }
    fn on_channel_close(&mut self) {
        self.sink.post(self.convid.clone(), FlowEvent::ChannelClose);
    }
}

/// Timeouts a `Call` is constructed with (spec.md §3, §5; defaults
/// live on `CallManagerConfig`, SPEC_FULL.md §12).
#[derive(Clone, Copy, Debug)]
pub struct CallTimeouts {
    pub setup: Duration,
    pub term: Duration,
    pub dc_close: Duration,
    pub media_start: Duration,
    pub update: Duration,
}

pub struct Call {
    pub convid: ConversationId,
    pub conv_type: ConversationType,
    call_type: CallMediaType,
    self_userid: UserId,
    self_clientid: ClientId,
    direction: CallDirection,
    update: bool,
    answered: bool,
    video_negotiated: bool,
    media_started: bool,
    deferred_cbr_restart: bool,
    local_props: PropertySet,
    remote_props: PropertySet,
    connection: Connection,
    flow: Option<Box<dyn MediaFlow>>,
    flow_factory: Arc<dyn MediaFlowFactory>,
    event_sink: Arc<dyn CallEventSink>,
    turn_servers: Vec<TurnServer>,
    pending_offer_sdp: Option<String>,
    gather_phase: GatherPhase,
    retry_count: u32,
    max_retries: u32,
    quality_interval: Duration,
    timeouts: CallTimeouts,
    max_sdp_len: usize,
    last_msg_time: u64,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        convid: ConversationId,
        conv_type: ConversationType,
        call_type: CallMediaType,
        direction: CallDirection,
        self_userid: UserId,
        self_clientid: ClientId,
        max_retries: u32,
        timeouts: CallTimeouts,
        max_sdp_len: usize,
        flow_factory: Arc<dyn MediaFlowFactory>,
        event_sink: Arc<dyn CallEventSink>,
    ) -> Self {
        let role = match direction {
            CallDirection::Outgoing => Role::Creator,
            CallDirection::Incoming => Role::Joiner,
        };
        Call {
            convid,
            conv_type,
            call_type,
            self_userid,
            self_clientid,
            direction,
            update: false,
            answered: false,
            video_negotiated: matches!(call_type, CallMediaType::Video),
            media_started: false,
            deferred_cbr_restart: false,
            local_props: PropertySet::new(),
            remote_props: PropertySet::new(),
            connection: Connection::new(role, timeouts.setup, timeouts.term),
            flow: None,
            flow_factory,
            event_sink,
            turn_servers: Vec::new(),
            pending_offer_sdp: None,
            gather_phase: GatherPhase::None,
            retry_count: 0,
            max_retries,
            quality_interval: Duration::ZERO,
            timeouts,
            max_sdp_len,
            last_msg_time: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn data_channel_established(&self) -> bool {
        self.connection.data_channel_established()
    }

    /// Sends already-encoded bytes over the established data channel
    /// (spec.md §4.3 "Data-channel in-band signaling"). Callers must
    /// check [`Call::data_channel_established`] first; this fails with
    /// [`CallError::internal`] if no flow is active.
    pub fn dce_send(&mut self, bytes: &[u8]) -> Result<()> {
        self.flow_mut()?.dce_send(bytes)
    }

    pub fn is_terminating(&self) -> bool {
        self.connection.is_terminating()
    }

    pub fn peer_userid(&self) -> UserId {
        self.connection.remote_userid.clone().unwrap_or_default()
    }

    pub fn peer_clientid(&self) -> ClientId {
        self.connection.remote_clientid.clone().unwrap_or_default()
    }

    fn check_sdp_len(&self, sdp: &str) -> Result<()> {
        if sdp.len() > self.max_sdp_len {
            Err(CallError::Protocol(format!(
                "sdp too large: {} bytes (max {})",
                sdp.len(),
                self.max_sdp_len
            )))
        } else {
            Ok(())
        }
    }

    fn alloc_flow(&self) -> Result<Box<dyn MediaFlow>> {
        let vstate = self.local_props.derive_video_state();
        let mut flow = self
            .flow_factory
            .alloc(&self.convid, self.conv_type, self.call_type, vstate)?;
        flow.set_callbacks(Box::new(MarshalFlowCallbacks {
            convid: self.convid.clone(),
            sink: self.event_sink.clone(),
        }));
        for server in &self.turn_servers {
            flow.add_turnserver(server.clone())?;
        }
        if let (Some(u), Some(c)) = (&self.connection.remote_userid, &self.connection.remote_clientid) {
            flow.set_remote_userclientid(u, c);
        }
        Ok(flow)
    }

    // ---- public operations (spec.md §4.3) ----------------------------

    pub fn start(&mut self, call_type: CallMediaType, cbr: bool) -> Result<Vec<CallEffect>> {
        if self.connection.state() == ConnectionState::PendingIncoming {
            return self.answer(call_type, cbr);
        }
        if self.connection.state() != ConnectionState::Idle {
            return Err(CallError::AlreadyExists(
                "call already started on this convid".into(),
            ));
        }
        self.call_type = call_type;
        self.local_props.set(
            properties::KEY_VIDEO_SEND,
            if call_type == CallMediaType::Video { "true" } else { "false" },
        );
        self.local_props
            .set(properties::KEY_AUDIO_CBR, if cbr { "true" } else { "false" });
        self.flow = Some(self.alloc_flow()?);
        self.generate_offer()
    }

    pub fn answer(&mut self, call_type: CallMediaType, cbr: bool) -> Result<Vec<CallEffect>> {
        if self.connection.state() != ConnectionState::PendingIncoming {
            return Err(CallError::NotSupported(
                "answer requires a pending incoming call".into(),
            ));
        }
        self.call_type = call_type;
        self.local_props.set(
            properties::KEY_VIDEO_SEND,
            if call_type == CallMediaType::Video { "true" } else { "false" },
        );
        self.local_props
            .set(properties::KEY_AUDIO_CBR, if cbr { "true" } else { "false" });
        if self.flow.is_none() {
            self.flow = Some(self.alloc_flow()?);
        }
        self.generate_or_gather_answer()
    }

    pub fn end(&mut self) -> Vec<CallEffect> {
        if let Some(mut flow) = self.flow.take() {
            flow.stop_media();
            flow.close();
        }
        let effects = self.connection.local_end();
        self.translate_conn_effects(effects, true)
    }

    pub fn restart(&mut self, call_type: CallMediaType) -> Result<Vec<CallEffect>> {
        if !matches!(
            self.connection.state(),
            ConnectionState::Answered | ConnectionState::DataChanEstablished
        ) {
            return Err(CallError::NotSupported(
                "restart requires an established connection".into(),
            ));
        }
        if self.retry_count >= self.max_retries {
            let effects = self.connection.close(CallError::TimedOut);
            return Ok(self.translate_conn_effects(effects, false));
        }
        self.retry_count += 1;
        self.call_type = call_type;
        if call_type == CallMediaType::Video {
            self.video_negotiated = true;
        }
        if let Some(mut flow) = self.flow.take() {
            flow.stop_media();
            flow.close();
        }
        self.flow = Some(self.alloc_flow()?);
        self.update = true;
        self.gather_phase = GatherPhase::None;
        self.generate_offer()
    }

    /// Declines an incoming call before answering it (spec.md §4.4
    /// `reject(handle, convid)`). Symmetric to [`Call::end`] but sends
    /// REJECT instead of HANGUP and is only valid before answering.
    pub fn reject(&mut self) -> Result<Vec<CallEffect>> {
        if let Some(mut flow) = self.flow.take() {
            flow.stop_media();
            flow.close();
        }
        let effects = self.connection.local_reject()?;
        Ok(self.translate_conn_effects(effects, true))
    }

    pub fn add_turnserver(&mut self, server: TurnServer) -> Result<()> {
        if self.turn_servers.len() >= crate::common::MAX_TURN_SERVERS {
            return Err(CallError::Overflow("turn server list full".into()));
        }
        if let Some(flow) = self.flow.as_mut() {
            flow.add_turnserver(server.clone())?;
        }
        self.turn_servers.push(server);
        Ok(())
    }

    pub fn set_video_send_state(&mut self, vs: VideoState) -> Result<Vec<CallEffect>> {
        if self.call_type.is_forced_audio() && vs != VideoState::Stopped {
            return Err(CallError::NotSupported(
                "forced-audio call cannot send video".into(),
            ));
        }
        let key = if vs == VideoState::ScreenShare {
            properties::KEY_SCREEN_SEND
        } else {
            properties::KEY_VIDEO_SEND
        };
        let value = match vs {
            VideoState::Stopped => "false",
            VideoState::Started | VideoState::ScreenShare => "true",
            VideoState::Paused => "paused",
            VideoState::BadConnection => {
                return Err(CallError::invalid("BAD_CONNECTION is not a settable send state"))
            }
        };
        if self.local_props.get(key) == Some(value) {
            return Ok(vec![]);
        }
        self.local_props.set(key, value);
        if let Some(flow) = self.flow.as_mut() {
            flow.set_video_state(vs);
        }
        let mut out = Vec::new();
        if self.connection.is_connected() {
            let effects = self.connection.propsync_local(self.local_props.clone(), false)?;
            out.extend(self.translate_conn_effects(effects, false));
        }
        let escalating = value == "true" && self.connection.is_connected() && !self.video_negotiated;
        if escalating {
            self.video_negotiated = true;
            out.extend(self.restart(CallMediaType::Video)?);
        }
        Ok(out)
    }

    /// Not part of spec.md's explicit public-op table, but required to
    /// realize restart trigger (c) (spec.md §4.3 "CBR change request
    /// while ANSWERED — deferred until the data channel is
    /// established"), which has no other entry point given the crate's
    /// public surface mirrors spec.md exactly.
    pub fn set_local_audio_cbr(&mut self, enabled: bool) -> Result<Vec<CallEffect>> {
        let value = if enabled { "true" } else { "false" };
        if self.local_props.get(properties::KEY_AUDIO_CBR) == Some(value) {
            return Ok(vec![]);
        }
        self.local_props.set(properties::KEY_AUDIO_CBR, value);
        let mut out = Vec::new();
        if self.connection.is_connected() {
            let effects = self.connection.propsync_local(self.local_props.clone(), false)?;
            out.extend(self.translate_conn_effects(effects, false));
        }
        match self.connection.state() {
            ConnectionState::DataChanEstablished => out.extend(self.restart(self.call_type)?),
            ConnectionState::Answered => self.deferred_cbr_restart = true,
            _ => {}
        }
        Ok(out)
    }

    pub fn media_start(&mut self) -> Vec<CallEffect> {
        self.media_started = true;
        if let Some(flow) = self.flow.as_mut() {
            flow.start_media();
        }
        vec![CallEffect::CancelTimer(TimerScope::MediaStart)]
    }

    pub fn media_stop(&mut self) -> Vec<CallEffect> {
        self.media_started = false;
        if let Some(flow) = self.flow.as_mut() {
            flow.stop_media();
        }
        vec![CallEffect::Observe(ObserverEvent::MediaStopped)]
    }

    pub fn set_quality_interval(&mut self, ms: u32) -> Vec<CallEffect> {
        self.quality_interval = Duration::from_millis(ms as u64);
        if ms == 0 {
            vec![CallEffect::CancelTimer(TimerScope::Quality)]
        } else {
            vec![CallEffect::ArmTimer {
                kind: TimerScope::Quality,
                duration: self.quality_interval,
            }]
        }
    }

    pub fn msg_recv(&mut self, msg_time: u64, message: crate::core::signaling::Message) -> Result<Vec<CallEffect>> {
        self.last_msg_time = msg_time;
        self.connection
            .set_remote(&message.src_userid, &message.src_clientid);
        let is_response = message.is_response;
        match message.payload {
            Payload::Setup { sdp, props, .. } if !is_response => {
                self.pending_offer_sdp = Some(sdp.clone());
                let effects = self.connection.recv_setup_request(sdp, props)?;
                Ok(self.translate_conn_effects(effects, false))
            }
            Payload::Setup { sdp, props, reset } => {
                let effects = self.connection.recv_setup_response(sdp, props, reset)?;
                Ok(self.translate_conn_effects(effects, false))
            }
            Payload::Update { sdp, props } if !is_response => {
                let effects = self.connection.recv_update_request(sdp, props)?;
                Ok(self.translate_conn_effects(effects, false))
            }
            Payload::Update { .. } => {
                self.update = false;
                self.retry_count = 0;
                Ok(vec![CallEffect::CancelTimer(TimerScope::Update)])
            }
            Payload::PropSync { props } => {
                let effects = self.connection.recv_propsync(props, is_response)?;
                Ok(self.translate_conn_effects(effects, false))
            }
            Payload::Hangup { .. } => {
                let effects = self.connection.recv_hangup();
                Ok(self.translate_conn_effects(effects, false))
            }
            Payload::Reject => Ok(self.fail(CallError::Rejected)),
            Payload::Cancel => Ok(self.fail(CallError::Canceled)),
            Payload::Alert { level, description } => {
                log::warn!(
                    "convid={}: ALERT level={level} descr={description}",
                    self.convid
                );
                Ok(vec![])
            }
            Payload::GroupStart | Payload::GroupCheck | Payload::ConfStart { .. } => Ok(vec![]),
        }
    }

    /// A SETUP(resp) or REJECT arrived from this same user's other
    /// device while PENDING_OUTGOING (spec.md §4.4 demultiplexing
    /// special case); ends ringing locally rather than routing the
    /// message through the normal Econn path. `rejected` distinguishes
    /// REJECT (EREMOTE) from SETUP(resp) (EALREADY).
    pub fn close_for_other_device(&mut self, rejected: bool) -> Vec<CallEffect> {
        let err = if rejected {
            CallError::Rejected
        } else {
            CallError::AnsweredElsewhere
        };
        self.fail(err)
    }

    // ---- flow callback re-entry (spec.md §5, via CallEventSink) ------

    pub fn on_flow_estab(&mut self) -> Vec<CallEffect> {
        vec![
            CallEffect::ArmTimer {
                kind: TimerScope::MediaStart,
                duration: self.timeouts.media_start,
            },
            CallEffect::Observe(ObserverEvent::State(CallState::MediaEstablished)),
            CallEffect::Observe(ObserverEvent::MediaEstab { userid: self.peer_userid() }),
        ]
    }

    pub fn on_flow_error(&mut self, err: CallError) -> Vec<CallEffect> {
        let retryable = matches!(err, CallError::Io(_) | CallError::TimedOut)
            && matches!(
                self.connection.state(),
                ConnectionState::Answered | ConnectionState::DataChanEstablished
            )
            && self.retry_count < self.max_retries;
        if retryable {
            match self.restart(self.call_type) {
                Ok(effects) => effects,
                Err(e) => self.fail(e),
            }
        } else {
            self.fail(err)
        }
    }

    pub fn on_flow_stopped(&mut self) -> Vec<CallEffect> {
        vec![CallEffect::Observe(ObserverEvent::MediaStopped)]
    }

    pub fn on_flow_rtp_start(&mut self) -> Vec<CallEffect> {
        self.media_started = true;
        vec![CallEffect::CancelTimer(TimerScope::MediaStart)]
    }

    pub fn on_flow_restart_requested(&mut self) -> Vec<CallEffect> {
        if self.connection.state() == ConnectionState::DataChanEstablished {
            match self.restart(self.call_type) {
                Ok(effects) => effects,
                Err(e) => self.fail(e),
            }
        } else {
            vec![]
        }
    }

    pub fn on_gather_complete(&mut self) -> Vec<CallEffect> {
        if self.connection.is_terminating() {
            return vec![];
        }
        let result = match self.gather_phase {
            GatherPhase::Offer => self.finish_offer(),
            GatherPhase::Answer => self.finish_answer(),
            GatherPhase::None | GatherPhase::Complete => return vec![],
        };
        match result {
            Ok(effects) => effects,
            Err(e) => self.fail(e),
        }
    }

    pub fn on_channel_estab(&mut self) -> Vec<CallEffect> {
        let mut out = vec![CallEffect::CancelTimer(TimerScope::DcClose)];
        match self.connection.channel_established() {
            Ok(effects) => out.extend(self.translate_conn_effects(effects, false)),
            Err(e) => log::warn!("convid={}: {e}", self.convid),
        }
        if self.deferred_cbr_restart {
            self.deferred_cbr_restart = false;
            match self.restart(self.call_type) {
                Ok(effects) => out.extend(effects),
                Err(e) => out.extend(self.fail(e)),
            }
        }
        out
    }

    pub fn on_channel_close(&mut self) -> Vec<CallEffect> {
        vec![CallEffect::ArmTimer {
            kind: TimerScope::DcClose,
            duration: self.timeouts.dc_close,
        }]
    }

    pub fn on_dce_recv(&mut self, bytes: Vec<u8>) -> Result<Vec<CallEffect>> {
        let decoded = crate::core::signaling::Message::decode(self.last_msg_time, self.last_msg_time, &bytes)?;
        self.msg_recv(decoded.msg_time, decoded.message)
    }

    // ---- timer re-entry -----------------------------------------------

    pub fn timer_setup_fired(&mut self) -> Vec<CallEffect> {
        let effects = self.connection.timer_setup_fired();
        self.translate_conn_effects(effects, false)
    }

    pub fn timer_term_fired(&mut self) -> Vec<CallEffect> {
        let effects = self.connection.timer_term_fired();
        self.translate_conn_effects(effects, false)
    }

    pub fn timer_media_start_fired(&mut self) -> Vec<CallEffect> {
        if self.media_started {
            return vec![];
        }
        self.fail(CallError::Io("media-start watchdog expired".into()))
    }

    pub fn timer_dc_close_fired(&mut self) -> Vec<CallEffect> {
        if self.connection.data_channel_established() {
            return vec![];
        }
        self.fail(CallError::DataChannel(
            "data channel did not re-establish in time".into(),
        ))
    }

    pub fn timer_update_fired(&mut self) -> Vec<CallEffect> {
        if !self.update {
            return vec![];
        }
        self.fail(CallError::TimedOut)
    }

    pub fn timer_quality_fired(&mut self) -> Vec<CallEffect> {
        let mut out = Vec::new();
        if let Some(flow) = self.flow.as_ref() {
            let stats = flow.get_stats();
            let quality = if stats.rtt_ms > 800 || stats.uplink_loss_pct > 20 || stats.downlink_loss_pct > 20 {
                NetworkQuality::Poor
            } else if stats.rtt_ms > 400 || stats.uplink_loss_pct > 5 || stats.downlink_loss_pct > 5 {
                NetworkQuality::Medium
            } else {
                NetworkQuality::Normal
            };
            out.push(CallEffect::Observe(ObserverEvent::NetworkQuality {
                userid: self.peer_userid(),
                quality,
                rtt_ms: stats.rtt_ms,
                uplink_loss_pct: stats.uplink_loss_pct,
                downlink_loss_pct: stats.downlink_loss_pct,
            }));
        }
        if !self.quality_interval.is_zero() {
            out.push(CallEffect::ArmTimer {
                kind: TimerScope::Quality,
                duration: self.quality_interval,
            });
        }
        out
    }

    // ---- async SDP gather protocol (spec.md §4.3) ---------------------

    fn generate_offer(&mut self) -> Result<Vec<CallEffect>> {
        let gathered = self.flow_mut()?.is_gathered();
        if gathered {
            self.finish_offer()
        } else {
            self.gather_phase = GatherPhase::Offer;
            self.flow_mut()?.gather_all_turn(true);
            Ok(vec![])
        }
    }

    fn finish_offer(&mut self) -> Result<Vec<CallEffect>> {
        let sdp = self.flow_mut()?.generate_offer()?;
        self.check_sdp_len(&sdp)?;
        self.gather_phase = GatherPhase::Complete;
        let effects = if self.update {
            let e = self.connection.update_req_local(sdp, self.local_props.clone())?;
            let mut out = self.translate_conn_effects(e, false);
            out.push(CallEffect::ArmTimer {
                kind: TimerScope::Update,
                duration: self.timeouts.update,
            });
            out
        } else {
            let e = self.connection.start(sdp, self.local_props.clone())?;
            let mut out = vec![CallEffect::Observe(ObserverEvent::State(CallState::Outgoing))];
            out.extend(self.translate_conn_effects(e, false));
            out
        };
        Ok(effects)
    }

    fn generate_or_gather_answer(&mut self) -> Result<Vec<CallEffect>> {
        if let Some(offer_sdp) = self.pending_offer_sdp.take() {
            self.flow_mut()?
                .handle_offer(&offer_sdp)
                .map_err(|_| CallError::BadMessage("flow rejected pending offer".into()))?;
        }
        let gathered = self.flow_mut()?.is_gathered();
        if gathered {
            self.finish_answer()
        } else {
            self.gather_phase = GatherPhase::Answer;
            self.flow_mut()?.gather_all_turn(false);
            Ok(vec![])
        }
    }

    fn finish_answer(&mut self) -> Result<Vec<CallEffect>> {
        let sdp = self.flow_mut()?.generate_answer()?;
        self.check_sdp_len(&sdp)?;
        self.gather_phase = GatherPhase::Complete;
        self.answered = true;
        let effects = self.connection.answer(sdp, self.local_props.clone())?;
        Ok(self.translate_conn_effects(effects, false))
    }

    fn accept_remote_update(&mut self, sdp: String) -> Result<Vec<CallEffect>> {
        {
            let flow = self.flow_mut()?;
            flow.handle_offer(&sdp)
                .map_err(|_| CallError::BadMessage("flow rejected UPDATE offer".into()))?;
        }
        let answer = self.flow_mut()?.generate_answer()?;
        self.check_sdp_len(&answer)?;
        let effects = self.connection.update_resp_local(answer, self.local_props.clone())?;
        Ok(self.translate_conn_effects(effects, false))
    }

    fn flow_mut(&mut self) -> Result<&mut Box<dyn MediaFlow>> {
        self.flow
            .as_mut()
            .ok_or_else(|| CallError::internal("no active media flow"))
    }

    fn apply_remote_video_state(&self, out: &mut Vec<CallEffect>) {
        if self.call_type.is_forced_audio() {
            return;
        }
        let vstate = self.remote_props.derive_video_state();
        out.push(CallEffect::Observe(ObserverEvent::VState {
            userid: self.peer_userid(),
            clientid: self.peer_clientid(),
            vstate,
        }));
    }

    fn apply_cbr(&mut self, out: &mut Vec<CallEffect>) {
        let enabled = self.local_props.audio_cbr() && self.remote_props.audio_cbr();
        if let Some(flow) = self.flow.as_mut() {
            flow.set_audio_cbr(enabled);
        }
        out.push(CallEffect::Observe(ObserverEvent::Acbr {
            userid: self.peer_userid(),
            enabled,
        }));
    }

    /// Forces termination with an explicit error, mirroring
    /// [`Connection::close`] one level up: stops and releases the
    /// flow, then lets the `Connection` decide whether a HANGUP still
    /// needs to go out.
    fn fail(&mut self, err: CallError) -> Vec<CallEffect> {
        if let Some(mut flow) = self.flow.take() {
            flow.stop_media();
            flow.close();
        }
        let effects = self.connection.close(err);
        self.translate_conn_effects(effects, false)
    }

    fn translate_conn_effects(&mut self, effects: Vec<connection::Effect>, local_terminate: bool) -> Vec<CallEffect> {
        let mut out = Vec::new();
        for effect in effects {
            match effect {
                connection::Effect::Send { payload, is_response } => {
                    out.push(CallEffect::Send { payload, is_response })
                }
                connection::Effect::RaiseIncoming { sdp, props } => {
                    self.pending_offer_sdp = Some(sdp);
                    self.remote_props.replace(props);
                    let video = matches!(
                        self.remote_props.derive_video_state(),
                        VideoState::Started | VideoState::ScreenShare
                    );
                    out.push(CallEffect::Observe(ObserverEvent::State(CallState::Incoming)));
                    out.push(CallEffect::Observe(ObserverEvent::Incoming {
                        msg_time: self.last_msg_time,
                        userid: self.peer_userid(),
                        video,
                        should_ring: self.conv_type != ConversationType::Conference,
                    }));
                }
                connection::Effect::RaiseAnswered { sdp, props, reset } => {
                    self.remote_props.replace(props);
                    self.apply_remote_video_state(&mut out);
                    self.apply_cbr(&mut out);
                    self.answered = true;
                    out.push(CallEffect::Observe(ObserverEvent::State(CallState::Answered)));
                    out.push(CallEffect::Observe(ObserverEvent::Answered));
                    if reset {
                        log::info!(
                            "convid={}: SETUP(resp) carried reset; treating payload as a fresh offer",
                            self.convid
                        );
                        match self.accept_remote_update(sdp) {
                            Ok(effects) => out.extend(effects),
                            Err(e) => out.extend(self.fail(e)),
                        }
                    } else if let Some(flow) = self.flow.as_mut() {
                        if let Err(e) = flow.handle_answer(&sdp) {
                            out.extend(self.fail(e));
                        }
                    }
                }
                connection::Effect::RaiseUpdateReq { sdp, props } => {
                    self.remote_props.replace(props);
                    self.apply_remote_video_state(&mut out);
                    match self.accept_remote_update(sdp) {
                        Ok(effects) => out.extend(effects),
                        Err(e) => out.extend(self.fail(e)),
                    }
                }
                connection::Effect::RaisePropSync { props, is_response } => {
                    self.remote_props.replace(props);
                    self.apply_remote_video_state(&mut out);
                    self.apply_cbr(&mut out);
                    if !is_response {
                        if let Ok(resp_effects) =
                            self.connection.propsync_local(self.local_props.clone(), true)
                        {
                            out.extend(self.translate_conn_effects(resp_effects, false));
                        }
                    }
                }
                connection::Effect::RaiseChannelEstablished => {
                    out.push(CallEffect::Observe(ObserverEvent::DcEstab { userid: self.peer_userid() }));
                }
                connection::Effect::RaiseClosed { error } => {
                    if let Some(mut flow) = self.flow.take() {
                        flow.stop_media();
                        flow.close();
                    }
                    let reason = error.as_ref().map(CallError::reason).unwrap_or(CloseReason::Normal);
                    let state = if local_terminate {
                        CallState::TerminatingLocal
                    } else {
                        CallState::TerminatingRemote
                    };
                    out.push(CallEffect::CancelTimer(TimerScope::MediaStart));
                    out.push(CallEffect::CancelTimer(TimerScope::Quality));
                    out.push(CallEffect::CancelTimer(TimerScope::DcClose));
                    out.push(CallEffect::CancelTimer(TimerScope::Update));
                    out.push(CallEffect::Observe(ObserverEvent::State(state)));
                    out.push(CallEffect::Observe(ObserverEvent::Close {
                        reason,
                        msg_time: self.last_msg_time,
                        userid: self.peer_userid(),
                    }));
                }
                connection::Effect::ArmTimer { kind, duration } => {
                    out.push(CallEffect::ArmTimer { kind: kind.into(), duration })
                }
                connection::Effect::CancelTimer(kind) => out.push(CallEffect::CancelTimer(kind.into())),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowCallbacks, FlowStats};

    struct NullSink;
    impl CallEventSink for NullSink {
        fn post(&self, _convid: ConversationId, _event: FlowEvent) {}
    }

    struct InstantFlow {
        gathered: bool,
        cbr: bool,
    }

    impl MediaFlow for InstantFlow {
        fn set_callbacks(&mut self, _callbacks: Box<dyn FlowCallbacks>) {}
        fn add_turnserver(&mut self, _server: TurnServer) -> Result<()> {
            Ok(())
        }
        fn set_remote_userclientid(&mut self, _userid: &str, _clientid: &str) {}
        fn set_video_state(&mut self, _state: VideoState) {}
        fn gather_all_turn(&mut self, _is_offer: bool) {
            self.gathered = true;
        }
        fn is_gathered(&self) -> bool {
            self.gathered
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
        fn set_audio_cbr(&mut self, enabled: bool) {
            self.cbr = enabled;
        }
        fn get_audio_cbr(&self, _include_negotiated: bool) -> bool {
            self.cbr
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
            Ok(Box::new(InstantFlow { gathered: true, cbr: false }))
        }
    }

    fn timeouts() -> CallTimeouts {
        CallTimeouts {
            setup: Duration::from_secs(60),
            term: Duration::from_secs(5),
            dc_close: Duration::from_secs(10),
            media_start: Duration::from_secs(10),
            update: Duration::from_secs(10),
        }
    }

    fn outgoing_call() -> Call {
        Call::new(
            "c1".into(),
            ConversationType::OneOnOne,
            CallMediaType::Normal,
            CallDirection::Outgoing,
            "alice".into(),
            "a1".into(),
            0,
            timeouts(),
            8192,
            Arc::new(InstantFactory),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn start_with_gathered_flow_emits_setup_immediately() {
        let mut call = outgoing_call();
        let effects = call.start(CallMediaType::Video, true).unwrap();
        assert!(effects
            .iter()
            .any(|e| matches!(e, CallEffect::Send { is_response: false, .. })));
        assert_eq!(call.state(), ConnectionState::PendingOutgoing);
    }

    #[test]
    fn turn_server_overflow_is_reported_and_list_stays_bounded() {
        let mut call = outgoing_call();
        for _ in 0..8 {
            call.add_turnserver(TurnServer {
                url: "turn:x".into(),
                username: "u".into(),
                credential: "c".into(),
            })
            .unwrap();
        }
        let ninth = call.add_turnserver(TurnServer {
            url: "turn:x".into(),
            username: "u".into(),
            credential: "c".into(),
        });
        assert!(matches!(ninth, Err(CallError::Overflow(_))));
        assert_eq!(call.turn_servers.len(), 8);
    }

    #[test]
    fn repeated_identical_video_send_state_is_idempotent() {
        let mut call = outgoing_call();
        call.start(CallMediaType::Normal, false).unwrap();
        let first = call.set_video_send_state(VideoState::Stopped).unwrap();
        assert!(first.is_empty());
    }
}
