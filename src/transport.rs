//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The backend relay interface consumed from the application (spec.md
//! §6 "Transport interface consumed from the application"). The
//! backend itself (HTTP, websocket, whatever the embedding application
//! uses) is entirely out of scope; this crate only ever hands it
//! opaque bytes.

use crate::common::{ClientId, ConversationId, Result, UserId};

/// A correlation handle the transport returns from [`Transport::send`]
/// and passes back to [`crate::core::manager::CallManager::resp`] once
/// delivery completes or fails. Opaque to this crate.
pub type SendContext = u64;

pub trait Transport: Send {
    /// Requests delivery of a signaling message. Empty `dest_*` means
    /// broadcast to the conversation. `transient` hints the transport
    /// may drop this message under congestion rather than queue it
    /// (spec.md §6).
    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        ctx: SendContext,
        convid: &ConversationId,
        self_userid: &UserId,
        self_clientid: &ClientId,
        dest_userid: Option<&UserId>,
        dest_clientid: Option<&ClientId>,
        bytes: &[u8],
        transient: bool,
    ) -> Result<()>;
}
