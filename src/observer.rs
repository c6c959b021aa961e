//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Application-facing callbacks (spec.md §6 "Application-facing
//! callbacks"). The embedding application implements [`Observer`] and
//! hands it to [`crate::core::manager::CallManager::new`].

use crate::common::{
    CallState, ClientId, CloseReason, ConversationId, NetworkQuality, UserId, VideoState,
};

pub trait Observer: Send {
    /// The instance finished initializing and is ready for use.
    fn ready(&mut self, version: &str);
    // Note: spec.md's application-callback list also names a `send`
    // entry; the original wcall.c callback struct bundles the send
    // handler together with every other callback. Here that handler is
    // its own [`crate::transport::Transport`] trait instead of an
    // `Observer` method, since it has a different, request/response
    // shaped signature (ctx + resp) that doesn't fit this trait's other
    // fire-and-forget notifications.
    fn incoming(&mut self, convid: &ConversationId, msg_time: u64, userid: &UserId, video: bool, should_ring: bool);
    fn missed(&mut self, convid: &ConversationId, msg_time: u64, userid: &UserId, video: bool);
    fn answered(&mut self, convid: &ConversationId);
    fn estab(&mut self, convid: &ConversationId, userid: &UserId);
    fn close(&mut self, reason: CloseReason, convid: &ConversationId, msg_time: u64, userid: &UserId);
    fn metrics(&mut self, convid: &ConversationId, json: &str);
    /// The call needs fresh TURN/STUN configuration.
    fn cfg_req(&mut self);
    fn state(&mut self, convid: &ConversationId, state: CallState);
    fn vstate(&mut self, convid: &ConversationId, userid: &UserId, clientid: &ClientId, vstate: VideoState);
    fn acbr(&mut self, userid: &UserId, enabled: bool);
    fn media_estab(&mut self, convid: &ConversationId, userid: &UserId);
    fn media_stopped(&mut self, convid: &ConversationId);
    fn dc_estab(&mut self, convid: &ConversationId, userid: &UserId);
    fn group_changed(&mut self, convid: &ConversationId);
    fn participant_changed_json(&mut self, convid: &ConversationId, json: &str);
    fn req_clients(&mut self, convid: &ConversationId);
    fn mute(&mut self, muted: bool);
    fn network_quality(
        &mut self,
        convid: &ConversationId,
        userid: &UserId,
        quality: NetworkQuality,
        rtt_ms: u32,
        uplink_loss_pct: u32,
        downlink_loss_pct: u32,
    );
    fn shutdown(&mut self);
    /// A diagnostic line the host application may want to surface in
    /// its own log sink, distinct from this crate's own use of the
    /// `log` facade (SPEC_FULL.md §10).
    fn log(&mut self, level: log::Level, msg: &str);
}

/// A single deferred [`Observer`] invocation (spec.md §9 "effects are
/// queued; the runtime flushes them"). `Call` and `CallManager`
/// produce these rather than calling an `Observer` directly, so the
/// state transition that produced them stays a plain total function.
pub enum ObserverEvent {
    Incoming { msg_time: u64, userid: UserId, video: bool, should_ring: bool },
    Missed { msg_time: u64, userid: UserId, video: bool },
    Answered,
    Estab { userid: UserId },
    Close { reason: CloseReason, msg_time: u64, userid: UserId },
    Metrics { json: String },
    CfgReq,
    State(CallState),
    VState { userid: UserId, clientid: ClientId, vstate: VideoState },
    Acbr { userid: UserId, enabled: bool },
    MediaEstab { userid: UserId },
    MediaStopped,
    DcEstab { userid: UserId },
    GroupChanged,
    ParticipantChangedJson { json: String },
    ReqClients,
    NetworkQuality {
        userid: UserId,
        quality: NetworkQuality,
        rtt_ms: u32,
        uplink_loss_pct: u32,
        downlink_loss_pct: u32,
    },
}

impl ObserverEvent {
    pub fn dispatch(self, convid: &ConversationId, observer: &mut dyn Observer) {
        match self {
            ObserverEvent::Incoming { msg_time, userid, video, should_ring } => {
                observer.incoming(convid, msg_time, &userid, video, should_ring)
            }
            ObserverEvent::Missed { msg_time, userid, video } => {
                observer.missed(convid, msg_time, &userid, video)
            }
            ObserverEvent::Answered => observer.answered(convid),
            ObserverEvent::Estab { userid } => observer.estab(convid, &userid),
            ObserverEvent::Close { reason, msg_time, userid } => {
                observer.close(reason, convid, msg_time, &userid)
            }
            ObserverEvent::Metrics { json } => observer.metrics(convid, &json),
            ObserverEvent::CfgReq => observer.cfg_req(),
            ObserverEvent::State(state) => observer.state(convid, state),
            ObserverEvent::VState { userid, clientid, vstate } => {
                observer.vstate(convid, &userid, &clientid, vstate)
            }
            ObserverEvent::Acbr { userid, enabled } => observer.acbr(&userid, enabled),
            ObserverEvent::MediaEstab { userid } => observer.media_estab(convid, &userid),
            ObserverEvent::MediaStopped => observer.media_stopped(convid),
            ObserverEvent::DcEstab { userid } => observer.dc_estab(convid, &userid),
            ObserverEvent::GroupChanged => observer.group_changed(convid),
            ObserverEvent::ParticipantChangedJson { json } => {
                observer.participant_changed_json(convid, &json)
            }
            ObserverEvent::ReqClients => observer.req_clients(convid),
            ObserverEvent::NetworkQuality {
                userid,
                quality,
                rtt_ms,
                uplink_loss_pct,
                downlink_loss_pct,
            } => observer.network_quality(
                convid,
                &userid,
                quality,
                rtt_ms,
                uplink_loss_pct,
                downlink_loss_pct,
            ),
        }
    }
}
