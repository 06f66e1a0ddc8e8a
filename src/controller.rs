//! Lifecycle controller state machine.
//!
//! A single task owns the [`LifecycleState`]. Everything that can move it
//! (decoded serial requests, poll ticks) arrives through this task's event
//! loop, so no two transitions or reply compositions ever interleave.
//! The transport talks to it through a [`ControllerHandle`] queue and gets
//! exactly one reply per request.
//!
//! `Starting` and `Stopping` are polling states: after issuing a runtime
//! command the machine re-checks [`ContainerRuntime::is_running`] every tick
//! until the target state is observed. If the runtime never confirms within
//! the settle timeout, the machine force-settles to the target terminal
//! state so it cannot park in a transient state forever.

use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::stats::MemorySampler;
use picoswitch_protocol::{LifecycleState, Request, StatusReply};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Requests waiting for the controller; later arrivals queue here.
const REQUEST_QUEUE_DEPTH: usize = 16;

/// A queued request plus the slot its reply goes into.
struct Envelope {
    request: Request,
    reply: oneshot::Sender<StatusReply>,
}

/// Cheap cloneable handle for dispatching requests to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ControllerHandle {
    /// Send a request and wait for its status reply.
    ///
    /// Fails only if the controller task has shut down.
    pub async fn dispatch(&self, request: Request) -> Result<StatusReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| crate::Error::Transport("controller task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| crate::Error::Transport("controller dropped the request".into()))
    }
}

/// The state machine task. Construct with [`Controller::new`], then hand
/// the returned future to the runtime via `controller.run()`.
pub struct Controller<R, S> {
    runtime: R,
    sampler: S,
    state: LifecycleState,
    /// Set while a transition is in flight; force-settle point.
    deadline: Option<Instant>,
    rx: mpsc::Receiver<Envelope>,
    shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    settle_timeout: Duration,
}

impl<R, S> Controller<R, S>
where
    R: ContainerRuntime,
    S: MemorySampler,
{
    /// Create the controller and its dispatch handle.
    pub fn new(
        runtime: R,
        sampler: S,
        poll_interval: Duration,
        settle_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let controller = Self {
            runtime,
            sampler,
            state: LifecycleState::Off,
            deadline: None,
            rx,
            shutdown_rx,
            poll_interval,
            settle_timeout,
        };
        (controller, ControllerHandle { tx })
    }

    /// Run the event loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(state = %self.state, "controller started");

        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            let reply = self.handle_request(envelope.request).await;
                            // Receiver may have hung up mid-request; nothing to do.
                            let _ = envelope.reply.send(reply);
                        }
                        None => {
                            tracing::info!("all handles dropped, controller stopping");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.poll_transition().await;
                }
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Apply one request to the state machine, then compose the reply from
    /// the state as it stands afterwards plus a fresh memory sample.
    async fn handle_request(&mut self, request: Request) -> StatusReply {
        tracing::debug!(state = %self.state, ?request, "handling request");

        match (self.state, request) {
            (LifecycleState::Off, Request::Start) => {
                match self.runtime.request_start().await {
                    Ok(()) => self.enter_transition(LifecycleState::Starting),
                    // The attempt did not change state; the reply reports Off
                    // and the firmware may retry with a fresh CMD:ON.
                    Err(e) => tracing::error!(error = %e, "failed to issue start"),
                }
            }
            (LifecycleState::On, Request::Stop) => match self.runtime.request_stop().await {
                Ok(()) => self.enter_transition(LifecycleState::Stopping),
                Err(e) => tracing::error!(error = %e, "failed to issue stop"),
            },
            // Already at or moving toward the requested state.
            (LifecycleState::Starting | LifecycleState::On, Request::Start)
            | (LifecycleState::Stopping | LifecycleState::Off, Request::Stop) => {
                tracing::debug!(state = %self.state, ?request, "request is a no-op");
            }
            // Opposite request while a transition is in flight: let the
            // transition settle first so the runtime never sees two
            // conflicting commands racing.
            (LifecycleState::Starting, Request::Stop)
            | (LifecycleState::Stopping, Request::Start) => {
                tracing::info!(state = %self.state, ?request, "transition in flight, ignoring");
            }
            (_, Request::Status) => {}
        }

        self.compose_reply().await
    }

    /// Advance a `Starting`/`Stopping` state from a timer tick.
    async fn poll_transition(&mut self) {
        let target = match self.state {
            LifecycleState::Starting => LifecycleState::On,
            LifecycleState::Stopping => LifecycleState::Off,
            // Terminal states have nothing to confirm.
            _ => return,
        };

        match self.runtime.is_running().await {
            Ok(running) if running == (target == LifecycleState::On) => {
                tracing::info!(from = %self.state, to = %target, "runtime confirmed transition");
                self.settle(target);
                return;
            }
            Ok(_) => {}
            // A failed query is indistinguishable from a slow runtime; keep
            // polling, the deadline bounds it.
            Err(e) => tracing::warn!(state = %self.state, error = %e, "runtime poll failed"),
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                tracing::warn!(
                    from = %self.state,
                    to = %target,
                    timeout_secs = self.settle_timeout.as_secs(),
                    "transition unconfirmed at timeout, assuming target state"
                );
                self.settle(target);
            }
        }
    }

    fn enter_transition(&mut self, state: LifecycleState) {
        tracing::info!(from = %self.state, to = %state, "entering transition");
        self.state = state;
        self.deadline = Some(Instant::now() + self.settle_timeout);
    }

    fn settle(&mut self, state: LifecycleState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.deadline = None;
    }

    /// Build a reply from the state at this instant plus a fresh sample.
    async fn compose_reply(&self) -> StatusReply {
        let (accel, general) = self.sampler.sample().await;
        StatusReply {
            state: self.state,
            accel,
            general,
        }
    }
}
