//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Property Set: an insertion-ordered string->string map (spec.md SS3),
//! carried on PROPSYNC and SETUP/UPDATE/ANSWER messages.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const KEY_VIDEO_SEND: &str = "videosend";
pub const KEY_SCREEN_SEND: &str = "screensend";
pub const KEY_AUDIO_CBR: &str = "audiocbr";

/// Recognized tri-state value for videosend/screensend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Paused,
}

impl TriState {
    fn parse(value: &str) -> Option<TriState> {
        match value {
            "true" => Some(TriState::True),
            "false" => Some(TriState::False),
            "paused" => Some(TriState::Paused),
            _ => None,
        }
    }
}

/// An ordered map preserving insertion order (spec.md SS9 "Property
/// map ordering... Encoder MUST be stable"). Unknown keys pass
/// through verbatim (spec.md SS8 invariant 3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertySet {
    entries: Vec<(String, String)>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Inserts or replaces a key, preserving the position of first
    /// insertion (matches the original's append-on-new,
    /// replace-in-place semantics).
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces the entire set with `other` (spec.md SS4.3: "Remote
    /// PROPSYNC updates are merged by replacing the remote property
    /// set with the incoming one, not field-wise merged").
    pub fn replace(&mut self, other: PropertySet) {
        *self = other;
    }

    fn tri_state(&self, key: &str) -> Option<TriState> {
        self.get(key).and_then(TriState::parse)
    }

    pub fn video_send(&self) -> Option<TriState> {
        self.tri_state(KEY_VIDEO_SEND)
    }

    pub fn screen_send(&self) -> Option<TriState> {
        self.tri_state(KEY_SCREEN_SEND)
    }

    pub fn audio_cbr(&self) -> bool {
        self.get(KEY_AUDIO_CBR) == Some("true")
    }

    /// Derives the remote video receive state from this (remote)
    /// property set, per spec.md SS4.3.
    pub fn derive_video_state(&self) -> crate::common::VideoState {
        use crate::common::VideoState;
        match (self.screen_send(), self.video_send()) {
            (Some(TriState::True), _) => VideoState::ScreenShare,
            (_, Some(TriState::True)) => VideoState::Started,
            (Some(TriState::Paused), _) => VideoState::Paused,
            (_, Some(TriState::Paused)) => VideoState::Paused,
            _ => VideoState::Stopped,
        }
    }
}

impl Serialize for PropertySet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PropertySet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PropertySetVisitor;

        impl<'de> Visitor<'de> for PropertySetVisitor {
            type Value = PropertySet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of string to string")
            }

            fn visit_map<A>(self, mut map: A) -> Result<PropertySet, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut props = PropertySet::new();
                while let Some((k, v)) = map.next_entry::<String, String>()? {
                    props.set(k, v);
                }
                Ok(props)
            }
        }

        deserializer.deserialize_map(PropertySetVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order_through_json_round_trip() {
        let mut props = PropertySet::new();
        props.set("screensend", "false");
        props.set("videosend", "true");
        props.set("audiocbr", "true");

        let json = serde_json::to_string(&props).unwrap();
        assert_eq!(json, r#"{"screensend":"false","videosend":"true","audiocbr":"true"}"#);

        let decoded: PropertySet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn replace_does_not_field_wise_merge() {
        let mut remote = PropertySet::new();
        remote.set("videosend", "true");
        remote.set("unknownkey", "kept");

        let mut incoming = PropertySet::new();
        incoming.set("audiocbr", "true");

        remote.replace(incoming);
        assert_eq!(remote.get("videosend"), None);
        assert_eq!(remote.get("unknownkey"), None);
        assert_eq!(remote.get("audiocbr"), Some("true"));
    }

    #[test]
    fn derive_video_state_screenshare_overrides_videosend() {
        let mut props = PropertySet::new();
        props.set("videosend", "false");
        props.set("screensend", "true");
        assert_eq!(props.derive_video_state(), crate::common::VideoState::ScreenShare);
    }

    #[test]
    fn derive_video_state_paused_when_not_already_started() {
        let mut props = PropertySet::new();
        props.set("screensend", "paused");
        assert_eq!(props.derive_video_state(), crate::common::VideoState::Paused);
    }

    #[test]
    fn derive_video_state_neither_set_is_stopped() {
        let props = PropertySet::new();
        assert_eq!(props.derive_video_state(), crate::common::VideoState::Stopped);
    }
}
