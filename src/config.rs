//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! `CallManagerConfig` (SPEC_FULL.md §12): built once per instance and
//! immutable thereafter, the way the teacher's `NativeCallContext`
//! takes its settings as explicit constructor parameters rather than
//! through a parsed config file.

use std::time::Duration;

use crate::core::call::CallTimeouts;

#[derive(Clone, Copy, Debug)]
pub struct CallManagerConfig {
    pub setup_timeout: Duration,
    pub term_timeout: Duration,
    pub dc_close_timeout: Duration,
    pub media_start_timeout: Duration,
    pub update_timeout: Duration,
    pub max_turn_servers: usize,
    pub max_sdp_len: usize,
    pub max_retries_one_to_one: u32,
    pub max_retries_group: u32,
    /// 0 disables the quality timer by default; `set_quality_interval`
    /// overrides this per call (spec.md §4.3).
    pub quality_interval_ms: u32,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        CallManagerConfig {
            setup_timeout: Duration::from_secs(60),
            term_timeout: Duration::from_secs(5),
            dc_close_timeout: Duration::from_secs(10),
            media_start_timeout: Duration::from_secs(10),
            update_timeout: Duration::from_secs(10),
            max_turn_servers: crate::common::MAX_TURN_SERVERS,
            max_sdp_len: crate::common::MAX_SDP_LEN,
            max_retries_one_to_one: 0,
            max_retries_group: 2,
            quality_interval_ms: 0,
        }
    }
}

impl CallManagerConfig {
    pub(crate) fn timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            setup: self.setup_timeout,
            term: self.term_timeout,
            dc_close: self.dc_close_timeout,
            media_start: self.media_start_timeout,
            update: self.update_timeout,
        }
    }

    pub(crate) fn max_retries(&self, conv_type: crate::common::ConversationType) -> u32 {
        match conv_type {
            crate::common::ConversationType::OneOnOne => self.max_retries_one_to_one,
            crate::common::ConversationType::Group | crate::common::ConversationType::Conference => {
                self.max_retries_group
            }
        }
    }
}
