//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Message Codec (spec.md SS4.1): encodes/decodes signaling messages to
//! a compact, self-delimited JSON text form, and classifies each
//! message type by its expected transport.

use std::fmt;

use serde_json::{Map, Value};

use crate::common::{ClientId, Result, UserId};
use crate::core::properties::PropertySet;
use crate::error::CallError;

/// The transport a message type is expected to travel over (spec.md
/// SS4.1's per-message-type table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Backend,
    DataChannel,
    Either,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum MessageType {
    Setup,
    Update,
    Cancel,
    Hangup,
    Reject,
    Alert,
    PropSync,
    GroupStart,
    GroupCheck,
    ConfStart,
}

impl MessageType {
    fn wire_tag(self) -> &'static str {
        match self {
            MessageType::Setup => "SETUP",
            MessageType::Update => "UPDATE",
            MessageType::Cancel => "CANCEL",
            MessageType::Hangup => "HANGUP",
            MessageType::Reject => "REJECT",
            MessageType::Alert => "ALERT",
            MessageType::PropSync => "PROPSYNC",
            MessageType::GroupStart => "GROUPSTART",
            MessageType::GroupCheck => "GROUPCHECK",
            MessageType::ConfStart => "CONFSTART",
        }
    }

    fn from_wire_tag(tag: &str) -> Result<MessageType> {
        Ok(match tag {
            "SETUP" => MessageType::Setup,
            "UPDATE" => MessageType::Update,
            "CANCEL" => MessageType::Cancel,
            "HANGUP" => MessageType::Hangup,
            "REJECT" => MessageType::Reject,
            "ALERT" => MessageType::Alert,
            "PROPSYNC" => MessageType::PropSync,
            "GROUPSTART" => MessageType::GroupStart,
            "GROUPCHECK" => MessageType::GroupCheck,
            "CONFSTART" => MessageType::ConfStart,
            other => return Err(CallError::BadMessage(format!("unknown message type {other}"))),
        })
    }

    /// The transport this message type is expected to arrive on
    /// (spec.md SS4.1). Receipt on the wrong transport is logged by
    /// the caller, not rejected here.
    pub fn preferred_transport(self) -> Transport {
        match self {
            MessageType::Setup => Transport::Backend,
            // SS4.3 "Data-channel in-band signaling" is explicit that
            // UPDATE always traverses the backend once established,
            // superseding the SS4.1 table's narrower "UPDATE(req)" wording.
            MessageType::Update => Transport::Backend,
            MessageType::Cancel => Transport::Backend,
            MessageType::Alert => Transport::Backend,
            MessageType::Reject => Transport::Backend,
            MessageType::PropSync => Transport::Either,
            MessageType::Hangup => Transport::DataChannel,
            MessageType::GroupStart | MessageType::GroupCheck | MessageType::ConfStart => {
                Transport::Backend
            }
        }
    }
}

/// Type-specific payload of a signaling message.
#[derive(Clone, Debug)]
pub enum Payload {
    /// SETUP: carries an SDP offer (request) or answer (response).
    /// `reset` (only meaningful on a response) asks the offerer to
    /// discard its flow and treat this payload as a fresh offer
    /// (spec.md SS4.2 "reset").
    Setup {
        sdp: String,
        props: PropertySet,
        reset: bool,
    },
    /// UPDATE: renegotiation offer/answer.
    Update { sdp: String, props: PropertySet },
    Cancel,
    Hangup { reason: Option<String> },
    Reject,
    /// ALERT: informational only (spec.md SS9 open question, resolved
    /// in SPEC_FULL.md SS4.2 -- logged, never changes Connection state).
    Alert { level: u32, description: String },
    PropSync { props: PropertySet },
    GroupStart,
    GroupCheck,
    ConfStart { sft_url: Option<String> },
}

impl Payload {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Payload::Setup { .. } => MessageType::Setup,
            Payload::Update { .. } => MessageType::Update,
            Payload::Cancel => MessageType::Cancel,
            Payload::Hangup { .. } => MessageType::Hangup,
            Payload::Reject => MessageType::Reject,
            Payload::Alert { .. } => MessageType::Alert,
            Payload::PropSync { .. } => MessageType::PropSync,
            Payload::GroupStart => MessageType::GroupStart,
            Payload::GroupCheck => MessageType::GroupCheck,
            Payload::ConfStart { .. } => MessageType::ConfStart,
        }
    }

    pub fn props(&self) -> Option<&PropertySet> {
        match self {
            Payload::Setup { props, .. } => Some(props),
            Payload::Update { props, .. } => Some(props),
            Payload::PropSync { props } => Some(props),
            _ => None,
        }
    }
}

/// A fully-formed signaling message (spec.md SS3 "Message").
#[derive(Clone, Debug)]
pub struct Message {
    pub src_userid: UserId,
    pub src_clientid: ClientId,
    /// Empty dest means broadcast to the conversation.
    pub dest_userid: Option<UserId>,
    pub dest_clientid: Option<ClientId>,
    /// A monotonically-assignable origination time, in seconds.
    pub time: u64,
    /// Seconds since origination, as observed by the receiver.
    pub age: u64,
    pub is_response: bool,
    pub transient: bool,
    pub payload: Payload,
    /// Unrecognized top-level fields, preserved verbatim across a
    /// decode/re-encode round trip (spec.md SS8 invariant 3).
    pub extra: Map<String, Value>,
}

/// The result of decoding, carrying the transport-supplied delivery
/// metadata alongside the message (spec.md SS4.1).
#[derive(Clone, Debug)]
pub struct Decoded {
    pub message: Message,
    pub curr_time: u64,
    pub msg_time: u64,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        self.payload.msg_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_userid.is_none() && self.dest_clientid.is_none()
    }

    /// A short, human readable diagnostic rendering, never including
    /// full SDP or property values (spec.md SS4.1 "canonical 'brief'
    /// rendering").
    pub fn brief(&self) -> String {
        let dir = if self.is_response { "resp" } else { "req" };
        match &self.payload {
            Payload::Setup { sdp, reset, .. } => {
                format!("SETUP({dir}, reset={reset}, {})", crate::common::redact(sdp))
            }
            Payload::Update { sdp, .. } => {
                format!("UPDATE({dir}, {})", crate::common::redact(sdp))
            }
            Payload::Cancel => "CANCEL".to_string(),
            Payload::Hangup { reason } => format!("HANGUP({:?})", reason),
            Payload::Reject => "REJECT".to_string(),
            Payload::Alert { level, .. } => format!("ALERT(level={level})"),
            Payload::PropSync { props } => format!("PROPSYNC({dir}, {} props)", props.len()),
            Payload::GroupStart => "GROUPSTART".to_string(),
            Payload::GroupCheck => format!("GROUPCHECK({dir})"),
            Payload::ConfStart { .. } => "CONFSTART".to_string(),
        }
    }

    /// Encodes the message to its compact wire form. Output is
    /// deterministic modulo property-set ordering, which is itself
    /// insertion-order stable (spec.md SS4.1).
    pub fn encode(&self) -> Result<String> {
        let mut map = Map::new();
        map.insert("type".into(), Value::String(self.msg_type().wire_tag().into()));
        map.insert("src_userid".into(), Value::String(self.src_userid.clone()));
        map.insert("src_clientid".into(), Value::String(self.src_clientid.clone()));
        if let Some(u) = &self.dest_userid {
            map.insert("dest_userid".into(), Value::String(u.clone()));
        }
        if let Some(c) = &self.dest_clientid {
            map.insert("dest_clientid".into(), Value::String(c.clone()));
        }
        map.insert("time".into(), Value::from(self.time));
        map.insert("age".into(), Value::from(self.age));
        map.insert("resp".into(), Value::Bool(self.is_response));
        map.insert("transient".into(), Value::Bool(self.transient));

        match &self.payload {
            Payload::Setup { sdp, props, reset } => {
                map.insert("sdp".into(), Value::String(sdp.clone()));
                map.insert("reset".into(), Value::Bool(*reset));
                map.insert("props".into(), serde_json::to_value(props)?);
            }
            Payload::Update { sdp, props } => {
                map.insert("sdp".into(), Value::String(sdp.clone()));
                map.insert("props".into(), serde_json::to_value(props)?);
            }
            Payload::Hangup { reason } => {
                if let Some(r) = reason {
                    map.insert("reason".into(), Value::String(r.clone()));
                }
            }
            Payload::Alert { level, description } => {
                map.insert("level".into(), Value::from(*level));
                map.insert("descr".into(), Value::String(description.clone()));
            }
            Payload::PropSync { props } => {
                map.insert("props".into(), serde_json::to_value(props)?);
            }
            Payload::ConfStart { sft_url } => {
                if let Some(url) = sft_url {
                    map.insert("sft_url".into(), Value::String(url.clone()));
                }
            }
            Payload::Cancel | Payload::Reject | Payload::GroupStart | Payload::GroupCheck => {}
        }

        for (k, v) in &self.extra {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }

        serde_json::to_string(&Value::Object(map)).map_err(|e| CallError::BadMessage(e.to_string()))
    }

    /// Decodes a message received from `curr_time`/`msg_time` delivery
    /// metadata plus the raw wire bytes (spec.md SS4.1).
    pub fn decode(curr_time: u64, msg_time: u64, bytes: &[u8]) -> Result<Decoded> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CallError::BadMessage(format!("not utf8: {e}")))?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| CallError::BadMessage(e.to_string()))?;
        let mut map = match value {
            Value::Object(map) => map,
            _ => return Err(CallError::BadMessage("expected a JSON object".into())),
        };

        let take_str = |map: &mut Map<String, Value>, key: &str| -> Option<String> {
            map.remove(key).and_then(|v| v.as_str().map(str::to_string))
        };

        let wire_tag = take_str(&mut map, "type")
            .ok_or_else(|| CallError::BadMessage("missing 'type'".into()))?;
        let msg_type = MessageType::from_wire_tag(&wire_tag)?;

        let src_userid = take_str(&mut map, "src_userid")
            .ok_or_else(|| CallError::BadMessage("missing 'src_userid'".into()))?;
        let src_clientid = take_str(&mut map, "src_clientid")
            .ok_or_else(|| CallError::BadMessage("missing 'src_clientid'".into()))?;
        let dest_userid = take_str(&mut map, "dest_userid");
        let dest_clientid = take_str(&mut map, "dest_clientid");
        let time = map
            .remove("time")
            .and_then(|v| v.as_u64())
            .unwrap_or(msg_time);
        let age = map.remove("age").and_then(|v| v.as_u64()).unwrap_or(0);
        let is_response = map
            .remove("resp")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let transient = map
            .remove("transient")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let take_props = |map: &mut Map<String, Value>| -> Result<PropertySet> {
            match map.remove("props") {
                Some(v) => serde_json::from_value(v).map_err(|e| CallError::BadMessage(e.to_string())),
                None => Ok(PropertySet::new()),
            }
        };

        let payload = match msg_type {
            MessageType::Setup => {
                let sdp = take_str(&mut map, "sdp")
                    .ok_or_else(|| CallError::BadMessage("SETUP missing 'sdp'".into()))?;
                let reset = map.remove("reset").and_then(|v| v.as_bool()).unwrap_or(false);
                let props = take_props(&mut map)?;
                Payload::Setup { sdp, props, reset }
            }
            MessageType::Update => {
                let sdp = take_str(&mut map, "sdp")
                    .ok_or_else(|| CallError::BadMessage("UPDATE missing 'sdp'".into()))?;
                let props = take_props(&mut map)?;
                Payload::Update { sdp, props }
            }
            MessageType::Cancel => Payload::Cancel,
            MessageType::Hangup => Payload::Hangup {
                reason: take_str(&mut map, "reason"),
            },
            MessageType::Reject => Payload::Reject,
            MessageType::Alert => {
                let level = map.remove("level").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let description = take_str(&mut map, "descr").unwrap_or_default();
                Payload::Alert { level, description }
            }
            MessageType::PropSync => Payload::PropSync {
                props: take_props(&mut map)?,
            },
            MessageType::GroupStart => Payload::GroupStart,
            MessageType::GroupCheck => Payload::GroupCheck,
            MessageType::ConfStart => Payload::ConfStart {
                sft_url: take_str(&mut map, "sft_url"),
            },
        };

        let message = Message {
            src_userid,
            src_clientid,
            dest_userid,
            dest_clientid,
            time,
            age,
            is_response,
            transient,
            payload,
            extra: map,
        };

        Ok(Decoded {
            message,
            curr_time,
            msg_time,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_message() -> Message {
        let mut props = PropertySet::new();
        props.set("videosend", "true");
        props.set("audiocbr", "true");
        Message {
            src_userid: "alice".into(),
            src_clientid: "a1".into(),
            dest_userid: None,
            dest_clientid: None,
            time: 1000,
            age: 0,
            is_response: false,
            transient: false,
            payload: Payload::Setup {
                sdp: "v=0...".into(),
                props,
                reset: false,
            },
            extra: Map::new(),
        }
    }

    #[test]
    fn encode_decode_round_trip_is_identity() {
        let msg = setup_message();
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(10, 5, encoded.as_bytes()).unwrap();
        assert_eq!(decoded.message.src_userid, "alice");
        assert_eq!(decoded.message.msg_type(), MessageType::Setup);
        assert_eq!(decoded.curr_time, 10);
        assert_eq!(decoded.msg_time, 5);
        let re_encoded = decoded.message.encode().unwrap();
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let mut msg = setup_message();
        msg.extra.insert("futurefield".into(), Value::String("kept".into()));
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(0, 0, encoded.as_bytes()).unwrap();
        assert_eq!(
            decoded.message.extra.get("futurefield"),
            Some(&Value::String("kept".into()))
        );
    }

    #[test]
    fn transport_routing_table() {
        assert_eq!(MessageType::Setup.preferred_transport(), Transport::Backend);
        assert_eq!(MessageType::Update.preferred_transport(), Transport::Backend);
        assert_eq!(MessageType::Cancel.preferred_transport(), Transport::Backend);
        assert_eq!(MessageType::Alert.preferred_transport(), Transport::Backend);
        assert_eq!(MessageType::PropSync.preferred_transport(), Transport::Either);
        assert_eq!(MessageType::Hangup.preferred_transport(), Transport::DataChannel);
        assert_eq!(MessageType::Reject.preferred_transport(), Transport::Backend);
    }

    #[test]
    fn decode_rejects_non_object() {
        assert!(Message::decode(0, 0, b"[1,2,3]").is_err());
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(Message::decode(0, 0, br#"{"type":"BOGUS"}"#).is_err());
    }
}
