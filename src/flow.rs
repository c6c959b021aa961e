//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The media flow interface consumed by [`crate::core::call::Call`]
//! (spec.md §6 "Media flow interface consumed by Ecall"). Media
//! transport, ICE/TURN gathering, RTP and codec selection are all
//! implemented on the other side of this trait; this crate never
//! implements them.

use crate::common::{CallMediaType, ConversationId, ConversationType, Result, VideoState};

/// Aggregate stats snapshot for the quality reporter (spec.md §4.3).
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowStats {
    pub rtt_ms: u32,
    pub uplink_loss_pct: u32,
    pub downlink_loss_pct: u32,
}

/// A TURN/STUN relay server description (spec.md §3, §8 boundary
/// "9th `add_turnserver` call... EOVERFLOW").
#[derive(Clone, Debug)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Callbacks a [`MediaFlow`] invokes back into its owning [`Call`]
/// (spec.md §6 `set_callbacks`). Implemented as a plain trait object
/// rather than a closure struct so `Call` can pass `self` without a
/// reference-counting scheme the teacher does not use elsewhere.
pub trait FlowCallbacks: Send {
    /// The media connection is fully established (DTLS/ICE complete).
    fn on_estab(&mut self);
    /// The flow has stopped unexpectedly and should be treated as a
    /// fatal error at the `Call` level.
    fn on_close(&mut self, err: crate::error::CallError);
    /// Media has stopped (clean stop, not an error).
    fn on_stopped(&mut self);
    /// The flow asks to begin RTP flow (autonomously, e.g. after
    /// re-establishment).
    fn on_rtp_start(&mut self);
    /// The flow requests a restart (e.g. after a detected network
    /// change) while the data channel was already established.
    fn on_restart(&mut self);
    /// Candidate gathering has completed.
    fn on_gather_complete(&mut self);
    /// The data channel is established.
    fn on_channel_estab(&mut self);
    /// Data received on the data channel (signaling in-band).
    fn on_dce_recv(&mut self, bytes: Vec<u8>);
    /// The data channel closed.
    fn on_channel_close(&mut self);
}

/// The media flow interface consumed by [`Call`] (spec.md §6). One
/// instance is allocated per `Call` attempt; a restart closes the old
/// flow and allocates a new one (spec.md §4.3 "Restart & recovery").
pub trait MediaFlow: Send {
    fn set_callbacks(&mut self, callbacks: Box<dyn FlowCallbacks>);

    fn add_turnserver(&mut self, server: TurnServer) -> Result<()>;
    fn set_remote_userclientid(&mut self, userid: &str, clientid: &str);
    fn set_video_state(&mut self, state: VideoState);

    /// Begins asynchronous candidate gathering. `is_offer` selects the
    /// ICE role. Completion is signaled via
    /// [`FlowCallbacks::on_gather_complete`].
    fn gather_all_turn(&mut self, is_offer: bool);
    fn is_gathered(&self) -> bool;

    fn handle_offer(&mut self, sdp: &str) -> Result<()>;
    fn handle_answer(&mut self, sdp: &str) -> Result<()>;
    fn generate_offer(&mut self) -> Result<String>;
    fn generate_answer(&mut self) -> Result<String>;

    fn dce_send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Asks the flow to begin/stop RTP (spec.md §4.3 `media_start` /
    /// `media_stop`: "ask flow to start/stop RTP"). `start_media` is
    /// the symmetric counterpart the distilled interface list names
    /// only implicitly alongside `stop_media`.
    fn start_media(&mut self);
    fn stop_media(&mut self);
    fn close(&mut self);

    fn get_stats(&self) -> FlowStats;

    fn set_audio_cbr(&mut self, enabled: bool);
    fn get_audio_cbr(&self, include_negotiated: bool) -> bool;

    fn enable_privacy(&mut self, enabled: bool);
    fn set_e2ee_key(&mut self, idx: u32, key: [u8; 32]);
}

/// Constructs flows for a given conversation (spec.md §6 `alloc`).
/// Kept as a separate trait from [`MediaFlow`] so `Call` can request a
/// *new* flow (restart) without needing to reach back through a
/// previous flow instance to do so.
pub trait MediaFlowFactory: Send + Sync {
    fn alloc(
        &self,
        convid: &ConversationId,
        conv_type: ConversationType,
        call_type: CallMediaType,
        vstate: VideoState,
    ) -> Result<Box<dyn MediaFlow>>;
}
