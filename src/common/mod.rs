//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the crate.

pub use crate::error::{CallError, Result};

/// A monotonic call identification number, unique within a process.
pub type CallId = u64;

/// An opaque conversation identifier. Calls are looked up by this
/// within a [`crate::core::manager::CallManager`].
pub type ConversationId = String;

/// A user identifier. Compared case-insensitively (see [`UserId::eq_ci`]).
pub type UserId = String;

/// A client (device) identifier. Compared case-insensitively.
pub type ClientId = String;

/// Case-insensitive comparison of (userid, clientid) pairs, used
/// throughout signaling to recognize "the same participant device"
/// regardless of casing differences introduced by transports.
pub fn same_user_client(a: (&str, &str), b: (&str, &str)) -> bool {
    a.0.eq_ignore_ascii_case(b.0) && a.1.eq_ignore_ascii_case(b.1)
}

pub fn same_user(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Deterministic total order over (user, client) pairs, used by the
/// creator predicate (spec.md SS4.2, SPEC_FULL.md SS4.2) so both peers
/// agree on who owes the answer without sharing a clock.
pub fn user_client_less(a: (&str, &str), b: (&str, &str)) -> bool {
    let a = (a.0.to_ascii_lowercase(), a.1.to_ascii_lowercase());
    let b = (b.0.to_ascii_lowercase(), b.1.to_ascii_lowercase());
    a < b
}

/// The conversation type a call belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ConversationType {
    OneOnOne,
    Group,
    Conference,
}

/// The call type requested or negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CallMediaType {
    Normal,
    Video,
    ForcedAudio,
}

impl CallMediaType {
    pub fn is_forced_audio(self) -> bool {
        matches!(self, CallMediaType::ForcedAudio)
    }
}

/// Which side of the offer/answer exchange this Connection plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Video send/recv state, as exposed to the application (spec.md SS3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum VideoState {
    Stopped,
    Started,
    ScreenShare,
    Paused,
    BadConnection,
}

/// Coarse application-visible call state (spec.md SS3, SS4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CallState {
    None,
    Outgoing,
    Incoming,
    Answered,
    MediaEstablished,
    TerminatingLocal,
    TerminatingRemote,
    Unknown,
}

/// Network quality buckets reported by the quality timer (spec.md SS4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum NetworkQuality {
    Normal,
    Medium,
    Poor,
}

/// The application-visible reason a call ended (spec.md SS4.4 error-to-reason
/// mapping).
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum CloseReason {
    Normal,
    Timeout,
    TimeoutEconn,
    LostMedia,
    Canceled,
    AnsweredElsewhere,
    IoError,
    DataChannel,
    Rejected,
    Error,
}

/// The data channel's well known label.
pub const DATA_CHANNEL_LABEL: &str = "calling";

/// Maximum SDP size accepted from the media flow (spec.md SS6).
pub const MAX_SDP_LEN: usize = 8 * 1024;

/// Maximum number of TURN servers retained per call (spec.md SS8).
pub const MAX_TURN_SERVERS: usize = 8;

pub(crate) fn now_ms_since(epoch_ms: u64, elapsed: std::time::Duration) -> u64 {
    epoch_ms.saturating_add(elapsed.as_millis() as u64)
}

/// Diagnostic helper matching the teacher's brief-message logging
/// convention: never logs full SDP or property values, only shapes.
pub fn redact(s: &str) -> String {
    if s.len() <= 24 {
        format!("<{} bytes>", s.len())
    } else {
        format!("{}...<{} bytes total>", &s[..16], s.len())
    }
}
