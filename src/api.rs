//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The public, handle-based API surface (spec.md §4.4's `create` /
//! `recv_msg` / `start` / ... list; SPEC_FULL.md §11 "FFI-shaped
//! boundary"). The embedding application never sees a [`CallManager`]
//! pointer, only an opaque [`Handle`]; every entry point re-validates
//! the handle before touching anything and marshals the actual work
//! onto that instance's core thread (spec.md §5, §9 "Raw pointers &
//! back-references... reimplement via stable handles into a slot
//! table").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, RwLock};

use lazy_static::lazy_static;

use crate::common::{CallMediaType, CallState, ClientId, ConversationId, ConversationType, Result, UserId, VideoState};
use crate::config::CallManagerConfig;
use crate::core::manager::CallManager;
use crate::error::CallError;
use crate::flow::{MediaFlowFactory, TurnServer};
use crate::observer::Observer;
use crate::runtime::{Marshal, Task};
use crate::transport::{SendContext, Transport};

/// An opaque per-instance handle. Never dereferenced directly by the
/// application; every function here maps it back to a [`Marshal`]
/// through [`REGISTRY`] first.
pub type Handle = u32;

/// XOR'd into every minted handle so a raw counter value (or a stray
/// small integer from unrelated code) is never mistaken for a valid
/// one (spec.md §4.4 "opaque 32-bit handles... XOR'd with a magic
/// tag").
const HANDLE_MAGIC: u32 = 0xC0A1_0000;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

fn mint_handle() -> Handle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed) ^ HANDLE_MAGIC
}

lazy_static! {
    /// The process-global instance registry (spec.md §5 "the process-
    /// global instance registry is protected by a reader/writer
    /// lock"). Each instance's own call list is protected separately,
    /// one level down, by the marshal's work queue.
    static ref REGISTRY: RwLock<HashMap<Handle, Marshal>> = RwLock::new(HashMap::new());
}

/// Creates a new instance bound to `(userid, clientid)` and returns its
/// handle (spec.md §4.4 `create(userid, clientid, callbacks…) →
/// handle`). The instance's core thread runs until [`destroy`] is
/// called.
pub fn create(
    userid: UserId,
    clientid: ClientId,
    config: CallManagerConfig,
    observer: Box<dyn Observer>,
    transport: Box<dyn Transport>,
    flow_factory: Arc<dyn MediaFlowFactory>,
) -> Handle {
    let (marshal, _core_thread) = Marshal::spawn(userid, clientid, config, observer, transport, flow_factory);
    let handle = mint_handle();
    REGISTRY.write().expect("instance registry poisoned").insert(handle, marshal);
    handle
}

/// Tears down an instance: every open call is ended, `shutdown` fires
/// on the observer, and the handle becomes invalid.
pub fn destroy(handle: Handle) -> Result<()> {
    let marshal = REGISTRY
        .write()
        .expect("instance registry poisoned")
        .remove(&handle)
        .ok_or_else(|| CallError::not_found("invalid instance handle"))?;
    marshal.stop();
    Ok(())
}

pub fn library_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn with_marshal<R>(handle: Handle, f: impl FnOnce(&Marshal) -> R) -> Result<R> {
    let registry = REGISTRY.read().expect("instance registry poisoned");
    let marshal = registry
        .get(&handle)
        .ok_or_else(|| CallError::not_found("invalid instance handle"))?;
    Ok(f(marshal))
}

/// Submits `f` to the instance's core thread and blocks until it runs,
/// returning its result. This is the rendezvous spec.md §7 assumes
/// when it says precondition errors are "reported to caller"
/// synchronously, even though the actual state machine only ever runs
/// on the core thread.
fn call_sync<T: Send + 'static>(marshal: &Marshal, f: impl FnOnce(&mut CallManager) -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    let task: Task = Box::new(move |manager| {
        let _ = tx.send(f(manager));
    });
    marshal.submit(task);
    rx.recv().expect("core thread dropped the reply channel before answering")
}

pub fn recv_msg(handle: Handle, convid: ConversationId, curr_time: u64, msg_time: u64, bytes: Vec<u8>) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.recv_msg(convid, curr_time, msg_time, &bytes))
    })?
}

pub fn start(
    handle: Handle,
    convid: ConversationId,
    conv_type: ConversationType,
    call_type: CallMediaType,
    cbr: bool,
) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.start(&convid, conv_type, call_type, cbr))
    })?
}

pub fn answer(handle: Handle, convid: ConversationId, call_type: CallMediaType, cbr: bool) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.answer(&convid, call_type, cbr))
    })?
}

pub fn end(handle: Handle, convid: ConversationId) -> Result<()> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.end(&convid)))?
}

pub fn reject(handle: Handle, convid: ConversationId) -> Result<()> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.reject(&convid)))?
}

pub fn restart(handle: Handle, convid: ConversationId, call_type: CallMediaType) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.restart(&convid, call_type))
    })?
}

pub fn add_turnserver(handle: Handle, convid: ConversationId, server: TurnServer) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.add_turnserver(&convid, server))
    })?
}

pub fn set_video_send_state(handle: Handle, convid: ConversationId, vstate: VideoState) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.set_video_send_state(&convid, vstate))
    })?
}

pub fn set_local_audio_cbr(handle: Handle, convid: ConversationId, enabled: bool) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.set_local_audio_cbr(&convid, enabled))
    })?
}

pub fn media_start(handle: Handle, convid: ConversationId) -> Result<()> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.media_start(&convid)))?
}

pub fn media_stop(handle: Handle, convid: ConversationId) -> Result<()> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.media_stop(&convid)))?
}

pub fn set_quality_interval(handle: Handle, convid: ConversationId, ms: u32) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.set_quality_interval(&convid, ms))
    })?
}

pub fn get_state(handle: Handle, convid: ConversationId) -> Result<CallState> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.get_state(&convid)))
}

/// Sets the instance-wide mute flag (spec.md §6 `mute(muted)`).
pub fn set_mute(handle: Handle, muted: bool) -> Result<()> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.set_mute(muted)))
}

pub fn get_mute(handle: Handle) -> Result<bool> {
    with_marshal(handle, |marshal| call_sync(marshal, |mgr| mgr.get_mute()))
}

pub fn iterate_state(handle: Handle, mut f: impl FnMut(&ConversationId, CallState)) -> Result<()> {
    let states = with_marshal(handle, |marshal| {
        call_sync(marshal, |mgr| {
            let mut collected = Vec::new();
            mgr.iterate_state(|convid, state| collected.push((convid.clone(), state)));
            collected
        })
    })?;
    for (convid, state) in states {
        f(&convid, state);
    }
    Ok(())
}

pub fn get_members(handle: Handle, convid: ConversationId) -> Result<Vec<(UserId, ClientId)>> {
    with_marshal(handle, |marshal| call_sync(marshal, move |mgr| mgr.get_members(&convid)))?
}

/// Delivery confirmation for a prior [`Transport::send`] (spec.md §6
/// `resp(ctx, status, reason)`).
pub fn resp(handle: Handle, ctx: SendContext, status: i32, reason: String) -> Result<()> {
    with_marshal(handle, |marshal| {
        call_sync(marshal, move |mgr| mgr.resp(ctx, status, &reason))
    })
}
