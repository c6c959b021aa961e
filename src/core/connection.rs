//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Connection: the per-peer signaling state machine (spec.md SS4.2,
//! "econn"). A total-function state machine over `(state, event) ->
//! (state', effects)` (spec.md SS9 "Async as callbacks"): every public
//! method here is synchronous, never blocks, and returns the list of
//! [`Effect`]s its owner ([`crate::core::call::Call`]) must carry out
//! (send a message, raise an event to the application, arm/cancel a
//! timer). The state machine never performs I/O itself.

use std::time::Duration;

use crate::common::{user_client_less, ClientId, Result, UserId};
use crate::core::properties::PropertySet;
use crate::core::signaling::Payload;
use crate::error::CallError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    Idle,
    PendingOutgoing,
    PendingIncoming,
    Answered,
    DataChanEstablished,
    HangupSent,
    HangupRecv,
    Terminating,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Role {
    Creator,
    Joiner,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum TimerKind {
    Setup,
    Term,
}

/// Work a [`Connection`] transition hands back to its owner.
#[derive(Debug)]
pub enum Effect {
    /// Emit a signaling message to the remote peer.
    Send { payload: Payload, is_response: bool },
    /// An inbound SETUP(req) arrived; the application should be asked
    /// whether to ring.
    RaiseIncoming { sdp: String, props: PropertySet },
    /// The outgoing SETUP got an answer.
    RaiseAnswered {
        sdp: String,
        props: PropertySet,
        reset: bool,
    },
    RaiseChannelEstablished,
    /// A remote UPDATE(req) arrived (renegotiation).
    RaiseUpdateReq { sdp: String, props: PropertySet },
    /// A PROPSYNC arrived from the remote peer.
    RaisePropSync {
        props: PropertySet,
        is_response: bool,
    },
    /// The connection has reached a terminal state.
    RaiseClosed { error: Option<CallError> },
    ArmTimer { kind: TimerKind, duration: Duration },
    CancelTimer(TimerKind),
}

/// Deterministic creator predicate (spec.md SS4.2 "Creator rule";
/// resolved in SPEC_FULL.md SS4.2 since the original's
/// `econn_is_creator_full` was not available to ground further): the
/// peer whose (user, client) pair sorts first, case-insensitively, is
/// the creator. Both sides compute this identically from data already
/// present in the message, with no shared clock required.
pub fn is_remote_creator(
    self_user: &str,
    self_client: &str,
    remote_user: &str,
    remote_client: &str,
) -> bool {
    user_client_less((remote_user, remote_client), (self_user, self_client))
}

pub struct Connection {
    pub remote_userid: Option<UserId>,
    pub remote_clientid: Option<ClientId>,
    pub role: Role,
    state: ConnectionState,
    error: Option<CallError>,
    setup_timeout: Duration,
    term_timeout: Duration,
}

impl Connection {
    pub fn new(role: Role, setup_timeout: Duration, term_timeout: Duration) -> Self {
        Connection {
            remote_userid: None,
            remote_clientid: None,
            role,
            state: ConnectionState::Idle,
            error: None,
            setup_timeout,
            term_timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error(&self) -> Option<&CallError> {
        self.error.as_ref()
    }

    pub fn is_terminating(&self) -> bool {
        self.state == ConnectionState::Terminating
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Answered | ConnectionState::DataChanEstablished
        )
    }

    pub fn data_channel_established(&self) -> bool {
        self.state == ConnectionState::DataChanEstablished
    }

    /// Binds the remote peer identity. Once bound, a request to
    /// re-bind to a *different* identity is logged and dropped (spec.md
    /// SS3 invariant: "An Ecall's peer, once set, is never re-assigned
    /// to different identifiers").
    pub fn set_remote(&mut self, userid: &str, clientid: &str) {
        match (&self.remote_userid, &self.remote_clientid) {
            (Some(u), Some(c)) if u == userid && c == clientid => {}
            (Some(u), Some(c)) => {
                log::warn!(
                    "connection: dropping attempt to re-bind remote from {u}/{c} to {userid}/{clientid}"
                );
            }
            _ => {
                self.remote_userid = Some(userid.to_string());
                self.remote_clientid = Some(clientid.to_string());
            }
        }
    }

    /// `IDLE -- local start(sdp,props) --> PENDING_OUTGOING`
    pub fn start(&mut self, sdp: String, props: PropertySet) -> Result<Vec<Effect>> {
        self.require(ConnectionState::Idle, "start")?;
        self.state = ConnectionState::PendingOutgoing;
        Ok(vec![
            Effect::Send {
                payload: Payload::Setup {
                    sdp,
                    props,
                    reset: false,
                },
                is_response: false,
            },
            Effect::ArmTimer {
                kind: TimerKind::Setup,
                duration: self.setup_timeout,
            },
        ])
    }

    /// `IDLE -- recv SETUP(req) from creator peer --> PENDING_INCOMING`
    pub fn recv_setup_request(
        &mut self,
        sdp: String,
        props: PropertySet,
    ) -> Result<Vec<Effect>> {
        self.require(ConnectionState::Idle, "recv_setup_request")?;
        self.state = ConnectionState::PendingIncoming;
        Ok(vec![
            Effect::RaiseIncoming { sdp, props },
            Effect::ArmTimer {
                kind: TimerKind::Setup,
                duration: self.setup_timeout,
            },
        ])
    }

    /// `PENDING_INCOMING -- local answer(sdp,props) --> ANSWERED`
    pub fn answer(&mut self, sdp: String, props: PropertySet) -> Result<Vec<Effect>> {
        self.require(ConnectionState::PendingIncoming, "answer")?;
        self.state = ConnectionState::Answered;
        Ok(vec![
            Effect::Send {
                payload: Payload::Setup {
                    sdp,
                    props,
                    reset: false,
                },
                is_response: true,
            },
            Effect::CancelTimer(TimerKind::Setup),
        ])
    }

    /// `PENDING_OUTGOING -- recv SETUP(resp[,reset]) --> ANSWERED`
    pub fn recv_setup_response(
        &mut self,
        sdp: String,
        props: PropertySet,
        reset: bool,
    ) -> Result<Vec<Effect>> {
        self.require(ConnectionState::PendingOutgoing, "recv_setup_response")?;
        self.state = ConnectionState::Answered;
        Ok(vec![
            Effect::RaiseAnswered { sdp, props, reset },
            Effect::CancelTimer(TimerKind::Setup),
        ])
    }

    /// `ANSWERED -- data channel established --> DATACHAN_ESTABLISHED`
    pub fn channel_established(&mut self) -> Result<Vec<Effect>> {
        self.require(ConnectionState::Answered, "channel_established")?;
        self.state = ConnectionState::DataChanEstablished;
        Ok(vec![Effect::RaiseChannelEstablished])
    }

    /// `ANSWERED|DATACHAN_ESTABLISHED -- local update_req(sdp,props)`
    pub fn update_req_local(&mut self, sdp: String, props: PropertySet) -> Result<Vec<Effect>> {
        self.require_connected("update_req_local")?;
        Ok(vec![Effect::Send {
            payload: Payload::Update { sdp, props },
            is_response: false,
        }])
    }

    /// `ANSWERED|DATACHAN_ESTABLISHED -- recv UPDATE(req)`
    pub fn recv_update_request(
        &mut self,
        sdp: String,
        props: PropertySet,
    ) -> Result<Vec<Effect>> {
        self.require_connected("recv_update_request")?;
        Ok(vec![Effect::RaiseUpdateReq { sdp, props }])
    }

    /// Sends the UPDATE(resp) answering a remote UPDATE(req). Symmetric
    /// to [`Connection::update_req_local`] but does not itself raise
    /// anything further -- it is the flow-level answer Call generates
    /// after accepting the renegotiation offer.
    pub fn update_resp_local(&mut self, sdp: String, props: PropertySet) -> Result<Vec<Effect>> {
        self.require_connected("update_resp_local")?;
        Ok(vec![Effect::Send {
            payload: Payload::Update { sdp, props },
            is_response: true,
        }])
    }

    /// Local PROPSYNC send (request or response form).
    pub fn propsync_local(&mut self, props: PropertySet, is_response: bool) -> Result<Vec<Effect>> {
        self.require_connected("propsync_local")?;
        Ok(vec![Effect::Send {
            payload: Payload::PropSync { props },
            is_response,
        }])
    }

    /// Remote PROPSYNC receipt.
    pub fn recv_propsync(
        &mut self,
        props: PropertySet,
        is_response: bool,
    ) -> Result<Vec<Effect>> {
        self.require_connected("recv_propsync")?;
        Ok(vec![Effect::RaisePropSync { props, is_response }])
    }

    /// `any -- local end() --> HANGUP_SENT -> TERMINATING`
    pub fn local_end(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Terminating {
            return vec![];
        }
        let was_established = self.state != ConnectionState::Idle;
        self.state = ConnectionState::Terminating;
        let mut effects = Vec::new();
        if was_established {
            effects.push(Effect::Send {
                payload: Payload::Hangup { reason: None },
                is_response: false,
            });
        }
        effects.push(Effect::RaiseClosed { error: None });
        effects.push(Effect::CancelTimer(TimerKind::Setup));
        effects.push(Effect::CancelTimer(TimerKind::Term));
        effects
    }

    /// `PENDING_INCOMING -- local reject() --> TERMINATING`
    pub fn local_reject(&mut self) -> Result<Vec<Effect>> {
        self.require(ConnectionState::PendingIncoming, "local_reject")?;
        self.state = ConnectionState::Terminating;
        Ok(vec![
            Effect::Send {
                payload: Payload::Reject,
                is_response: false,
            },
            Effect::RaiseClosed { error: None },
            Effect::CancelTimer(TimerKind::Setup),
            Effect::CancelTimer(TimerKind::Term),
        ])
    }

    /// `any -- recv HANGUP --> HANGUP_RECV -> TERMINATING`
    pub fn recv_hangup(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Terminating {
            return vec![];
        }
        self.state = ConnectionState::Terminating;
        vec![
            Effect::RaiseClosed { error: None },
            Effect::CancelTimer(TimerKind::Setup),
            Effect::CancelTimer(TimerKind::Term),
        ]
    }

    /// Forces termination with an explicit error (spec.md SS4.2 failure
    /// semantics; SS7 "never invoke close twice for the same call" is
    /// upheld by the idempotency check below).
    pub fn close(&mut self, err: CallError) -> Vec<Effect> {
        if self.state == ConnectionState::Terminating {
            return vec![];
        }
        let should_hangup = self.state != ConnectionState::Idle;
        self.error = Some(err.clone());
        self.state = ConnectionState::Terminating;
        let mut effects = Vec::new();
        if should_hangup {
            effects.push(Effect::Send {
                payload: Payload::Hangup {
                    reason: Some(err.to_string()),
                },
                is_response: false,
            });
        }
        effects.push(Effect::RaiseClosed { error: Some(err) });
        effects.push(Effect::CancelTimer(TimerKind::Setup));
        effects.push(Effect::CancelTimer(TimerKind::Term));
        effects
    }

    /// `timer: setup (default 60s) in pre-ANSWERED --> TERMINATING`
    pub fn timer_setup_fired(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::PendingOutgoing | ConnectionState::PendingIncoming => {
                self.close(CallError::TimedOut)
            }
            _ => vec![],
        }
    }

    /// `timer: term (default 5s) after hangup --> TERMINATING, free`
    pub fn timer_term_fired(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Terminating {
            vec![]
        } else {
            self.close(CallError::TimedOutEconn)
        }
    }

    fn require(&self, expected: ConnectionState, op: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CallError::NotSupported(format!(
                "{op}: unexpected state {:?}",
                self.state
            )))
        }
    }

    fn require_connected(&self, op: &str) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CallError::NotSupported(format!(
                "{op}: unexpected state {:?}",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(
            Role::Creator,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn happy_path_outgoing_to_datachannel() {
        let mut c = conn();
        let effects = c.start("offer".into(), PropertySet::new()).unwrap();
        assert_eq!(c.state(), ConnectionState::PendingOutgoing);
        assert!(matches!(effects[0], Effect::Send { is_response: false, .. }));

        c.recv_setup_response("answer".into(), PropertySet::new(), false)
            .unwrap();
        assert_eq!(c.state(), ConnectionState::Answered);

        c.channel_established().unwrap();
        assert_eq!(c.state(), ConnectionState::DataChanEstablished);
    }

    #[test]
    fn incoming_setup_then_answer() {
        let mut c = Connection::new(
            Role::Joiner,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );
        c.recv_setup_request("offer".into(), PropertySet::new())
            .unwrap();
        assert_eq!(c.state(), ConnectionState::PendingIncoming);

        let effects = c.answer("answer".into(), PropertySet::new()).unwrap();
        assert_eq!(c.state(), ConnectionState::Answered);
        assert!(matches!(effects[0], Effect::Send { is_response: true, .. }));
    }

    #[test]
    fn cannot_answer_before_incoming_setup() {
        let mut c = conn();
        assert!(c.answer("x".into(), PropertySet::new()).is_err());
    }

    #[test]
    fn setup_timeout_closes_with_timed_out() {
        let mut c = conn();
        c.start("offer".into(), PropertySet::new()).unwrap();
        let effects = c.timer_setup_fired();
        assert_eq!(c.state(), ConnectionState::Terminating);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RaiseClosed { error: Some(CallError::TimedOut) })));
    }

    #[test]
    fn setup_timeout_ignored_once_answered() {
        let mut c = conn();
        c.start("offer".into(), PropertySet::new()).unwrap();
        c.recv_setup_response("answer".into(), PropertySet::new(), false)
            .unwrap();
        let effects = c.timer_setup_fired();
        assert!(effects.is_empty());
        assert_eq!(c.state(), ConnectionState::Answered);
    }

    #[test]
    fn close_is_idempotent() {
        let mut c = conn();
        c.start("offer".into(), PropertySet::new()).unwrap();
        let first = c.close(CallError::Io("x".into()));
        assert!(!first.is_empty());
        let second = c.close(CallError::Io("x".into()));
        assert!(second.is_empty());
    }

    #[test]
    fn remote_rebind_to_different_identity_is_dropped() {
        let mut c = conn();
        c.set_remote("alice", "a1");
        c.set_remote("mallory", "m1");
        assert_eq!(c.remote_userid.as_deref(), Some("alice"));
        assert_eq!(c.remote_clientid.as_deref(), Some("a1"));
    }

    #[test]
    fn creator_predicate_is_symmetric() {
        assert!(is_remote_creator("bob", "b1", "alice", "a1"));
        assert!(!is_remote_creator("alice", "a1", "bob", "b1"));
    }

    #[test]
    fn reject_requires_pending_incoming() {
        let mut c = conn();
        assert!(c.local_reject().is_err());

        let mut c = Connection::new(Role::Joiner, Duration::from_secs(60), Duration::from_secs(5));
        c.recv_setup_request("offer".into(), PropertySet::new()).unwrap();
        let effects = c.local_reject().unwrap();
        assert_eq!(c.state(), ConnectionState::Terminating);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Send { payload: Payload::Reject, is_response: false })));
    }
}
