//
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The marshal (spec.md §5 "Concurrency & Resource Model"): a single
//! core thread that owns one [`CallManager`] and drains a bounded work
//! queue. Every public entry point in [`crate::api`] boils down to
//! submitting a closure here; every [`crate::flow::FlowCallbacks`]
//! invocation is re-expressed as a [`FlowEvent`] and submitted the
//! same way, so state transitions are never interleaved with each
//! other regardless of which thread originated them.

use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::common::ConversationId;
use crate::config::CallManagerConfig;
use crate::core::call::{CallEventSink, FlowEvent};
use crate::core::manager::CallManager;
use crate::flow::MediaFlowFactory;
use crate::observer::Observer;
use crate::transport::Transport;

/// A closure to run against the owned [`CallManager`]. `pub(crate)`
/// rather than private so [`crate::api`] can name it; never exported
/// from the crate.
pub(crate) type Task = Box<dyn FnOnce(&mut CallManager) + Send>;

/// One entry on the core thread's queue. Shutdown is a variant here
/// rather than inferred from the channel disconnecting, because the
/// `FlowEventRelay`'s own `Sender` clone (held inside the `CallManager`
/// it posts back to) never drops on its own, so the channel never
/// actually disconnects while the thread is alive.
pub(crate) enum Job {
    Run(Task),
    Shutdown,
}

/// Bridges [`FlowCallbacks`](crate::flow::FlowCallbacks) (which may
/// fire from a media engine thread) back onto the marshal, by
/// submitting a job that replays the event against the owned
/// [`CallManager`]. Wrapped in a [`Mutex`] because [`SyncSender`] is
/// `Send` but not `Sync`, and this sink is shared behind an `Arc`
/// across every `Call`'s media flow.
struct FlowEventRelay {
    sender: Mutex<SyncSender<Job>>,
}

impl CallEventSink for FlowEventRelay {
    fn post(&self, convid: ConversationId, event: FlowEvent) {
        let task: Task = Box::new(move |manager| manager.dispatch_flow_event(convid, event));
        let job = Job::Run(task);
        let sender = self.sender.lock().expect("marshal sender mutex poisoned");
        // The core thread outliving every sender is the common case; a
        // full queue or a torn-down marshal just drops the event.
        let _ = sender.try_send(job);
    }
}

/// A handle to a running marshal. Cloning shares the same underlying
/// queue and core thread; the queue itself is the synchronization
/// point (spec.md §5 "entry points marshal requests onto the core
/// thread via a bounded work queue").
#[derive(Clone)]
pub struct Marshal {
    sender: SyncSender<Job>,
}

/// Bound on the number of requests (API calls + replayed flow events)
/// the marshal will buffer before `submit` blocks the caller.
const QUEUE_DEPTH: usize = 256;

/// How long the core thread blocks waiting for the next job before
/// checking the timer wheel again. Bounded so per-call timers (setup,
/// term, dc-close, media-start, update, quality) fire promptly even
/// with no application traffic.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Marshal {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        self_userid: crate::common::UserId,
        self_clientid: crate::common::ClientId,
        config: CallManagerConfig,
        observer: Box<dyn Observer>,
        transport: Box<dyn Transport>,
        flow_factory: Arc<dyn MediaFlowFactory>,
    ) -> (Marshal, JoinHandle<()>) {
        let (sender, receiver) = mpsc::sync_channel::<Job>(QUEUE_DEPTH);
        let event_sink: Arc<dyn CallEventSink> = Arc::new(FlowEventRelay {
            sender: Mutex::new(sender.clone()),
        });

        let handle = std::thread::Builder::new()
            .name("callcore-marshal".into())
            .spawn(move || {
                let mut manager = CallManager::new(
                    self_userid,
                    self_clientid,
                    config,
                    observer,
                    transport,
                    flow_factory,
                    event_sink,
                );
                loop {
                    let wait = manager
                        .next_timer_deadline()
                        .map(|d| d.min(POLL_INTERVAL))
                        .unwrap_or(POLL_INTERVAL);
                    match receiver.recv_timeout(wait) {
                        Ok(Job::Run(task)) => task(&mut manager),
                        Ok(Job::Shutdown) => {
                            manager.shutdown();
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            manager.shutdown();
                            break;
                        }
                    }
                    manager.poll_timers();
                }
            })
            .expect("failed to spawn callcore-marshal thread");

        (Marshal { sender }, handle)
    }

    /// Enqueues `task` to run on the core thread. Blocks the caller only
    /// if the queue is momentarily full (spec.md §5 "applications may
    /// call the public WCall API from any thread").
    pub fn submit(&self, task: Task) {
        if self.sender.send(Job::Run(task)).is_err() {
            log::warn!("callcore marshal: core thread is gone, dropping submitted job");
        }
    }

    /// Requests an orderly shutdown: the core thread finishes any job
    /// already in flight, calls [`CallManager::shutdown`], and exits.
    /// Submitted as an explicit [`Job::Shutdown`] rather than simply
    /// dropping the sender, since the relay the manager itself holds
    /// keeps a second `Sender` clone alive for the thread's whole life
    /// and the channel would otherwise never disconnect.
    pub fn stop(self) {
        let _ = self.sender.send(Job::Shutdown);
    }
}
