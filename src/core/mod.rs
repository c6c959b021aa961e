//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Core signaling state machines: [`connection`] (the per-peer FSM),
//! [`call`] (the per-call controller), and [`manager`] (the
//! per-user call registry), plus their supporting types.

pub mod call;
pub mod connection;
pub mod manager;
pub mod properties;
pub mod signaling;
pub mod timers;
