//! Invocation controller
//!
//! One [`Invocation`] exists per call. It owns the isolate, the settlement
//! slot and the subscriber list, and walks an explicit lifecycle:
//!
//! `Created → Listening → Sent → Settled`
//!
//! - Created: the invocation exists, no isolate yet
//! - Listening: the isolate is running and the inbound channel is owned by
//!   the pump task, so nothing the isolate sends can be lost
//! - Sent: the input frame has been delivered (first poll of a promise, or
//!   an explicit start)
//! - Settled: resolved, rejected, faulted or terminated; the isolate has
//!   been released
//!
//! Settlement happens exactly once: the oneshot sender is taken under the
//! state lock, so whichever event is observed first wins.

use std::fmt;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use uuid::Uuid;

use super::console;
use super::error::{InvocationError, InvocationResult, IsolateFault, ProtocolViolation};
use super::host::{self, IsolateEvent, IsolateHandle, IsolateHost};
use super::program::Program;
use super::promise::Promise;
use super::protocol::Message;

/// Invocation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    /// Create a new random InvocationId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// First eight hex digits, used in isolate names
    pub fn short(&self) -> String {
        let mut text = self.0.simple().to_string();
        text.truncate(8);
        text
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No isolate yet
    Created,
    /// Isolate running, waiting for its input
    Listening,
    /// Input delivered
    Sent,
    /// Outcome decided and isolate released
    Settled,
}

pub(crate) type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// How an invocation ended
pub(crate) enum Outcome {
    Resolved(Value),
    Rejected(InvocationError),
    Violated(ProtocolViolation),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Resolved(_) => "resolved",
            Self::Rejected(InvocationError::Terminated) => "terminated",
            Self::Rejected(InvocationError::Fault(_)) => "faulted",
            Self::Rejected(_) => "rejected",
            Self::Violated(_) => "violated",
        }
    }

    /// Convert into the caller-facing result.
    ///
    /// # Panics
    ///
    /// A protocol violation is raised here, at the awaiting caller, instead
    /// of being turned into a rejection.
    pub(crate) fn into_result<T: DeserializeOwned>(self) -> InvocationResult<T> {
        match self {
            Self::Resolved(value) => serde_json::from_value(value).map_err(|err| {
                InvocationError::Marshal(format!("failed to decode result: {err}"))
            }),
            Self::Rejected(err) => Err(err),
            Self::Violated(violation) => panic!("{violation}"),
        }
    }
}

struct State {
    phase: Phase,
    input: Option<Vec<u8>>,
    to_isolate: Option<mpsc::UnboundedSender<Vec<u8>>>,
    isolate: Option<Box<dyn IsolateHandle>>,
    settle: Option<oneshot::Sender<Outcome>>,
    subscribers: Vec<(u64, Callback)>,
    next_subscriber: u64,
}

/// Shared state of one call
pub(crate) struct Invocation {
    id: InvocationId,
    name: String,
    state: Mutex<State>,
    released: Notify,
}

impl Invocation {
    pub(crate) fn new(id: InvocationId, name: String) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (settle, settled) = oneshot::channel();
        let invocation = Self {
            id,
            name,
            state: Mutex::new(State {
                phase: Phase::Created,
                input: None,
                to_isolate: None,
                isolate: None,
                settle: Some(settle),
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
            released: Notify::new(),
        };
        (Arc::new(invocation), settled)
    }

    pub(crate) fn id(&self) -> &InvocationId {
        &self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.phase() == Phase::Settled
    }

    fn listen(
        &self,
        isolate: Box<dyn IsolateHandle>,
        to_isolate: mpsc::UnboundedSender<Vec<u8>>,
        input: Vec<u8>,
    ) {
        let mut state = self.state.lock();
        state.isolate = Some(isolate);
        state.to_isolate = Some(to_isolate);
        state.input = Some(input);
        state.phase = Phase::Listening;
        tracing::debug!(invocation = %self.id, isolate = %self.name, "listening");
    }

    /// Deliver the input frame. No-op unless listening.
    pub(crate) fn start(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != Phase::Listening {
            return;
        }
        if let (Some(to_isolate), Some(frame)) = (state.to_isolate.as_ref(), state.input.take()) {
            if to_isolate.send(frame).is_err() {
                tracing::debug!(invocation = %self.id, "isolate gone before input was delivered");
            }
        }
        state.phase = Phase::Sent;
        tracing::debug!(invocation = %self.id, "input sent");
    }

    /// Decide the outcome and release the isolate.
    ///
    /// Returns false if the invocation had already settled.
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        let (sender, isolate, subscribers) = {
            let mut state = self.state.lock();
            let Some(sender) = state.settle.take() else {
                tracing::debug!(
                    invocation = %self.id,
                    outcome = outcome.label(),
                    "already settled, ignoring"
                );
                return false;
            };
            state.phase = Phase::Settled;
            state.input = None;
            state.to_isolate = None;
            let subscribers = std::mem::take(&mut state.subscribers);
            (sender, state.isolate.take(), subscribers)
        };

        // Callbacks may own the last handle to this invocation, and dropping
        // that handle locks the state again.
        drop(subscribers);
        if let Some(mut isolate) = isolate {
            isolate.terminate();
        }
        self.released.notify_one();

        tracing::debug!(invocation = %self.id, outcome = outcome.label(), "settled");
        let _ = sender.send(outcome);
        true
    }

    /// Release the isolate and reject with the termination sentinel
    pub(crate) fn terminate(&self) {
        self.settle(Outcome::Rejected(InvocationError::Terminated));
    }

    /// Register a callback. Callbacks registered after settlement are
    /// dropped immediately.
    pub(crate) fn subscribe(&self, callback: Callback) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        if state.phase == Phase::Settled {
            drop(state);
            drop(callback);
        } else {
            state.subscribers.push((id, callback));
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let position = state
                .subscribers
                .iter()
                .position(|(subscriber, _)| *subscriber == id);
            position.map(|index| state.subscribers.remove(index))
        };
        removed.is_some()
    }

    fn dispatch(&self, payload: &Value) {
        let subscribers: Vec<Callback> = self
            .state
            .lock()
            .subscribers
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                tracing::error!(invocation = %self.id, "notification subscriber panicked");
            }
        }
    }

    fn fault(&self, fault: IsolateFault) {
        tracing::warn!(invocation = %self.id, %fault, "isolate fault");
        self.settle(Outcome::Rejected(InvocationError::Fault(fault)));
    }

    fn violation(&self, violation: ProtocolViolation) {
        tracing::error!(invocation = %self.id, %violation, "isolate broke the message protocol");
        self.settle(Outcome::Violated(violation));
    }

    fn handle_frame(&self, frame: &[u8]) -> ControlFlow<()> {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(violation) => {
                self.violation(violation);
                return ControlFlow::Break(());
            }
        };

        match message {
            Message::Resolve(value) => {
                self.settle(Outcome::Resolved(value));
                ControlFlow::Break(())
            }
            Message::Reject(failure) => {
                self.settle(Outcome::Rejected(InvocationError::Rejected(failure)));
                ControlFlow::Break(())
            }
            Message::Notify(payload) => {
                self.dispatch(&payload);
                ControlFlow::Continue(())
            }
            Message::Log(args) => {
                console::replay_log(&self.id, &args);
                ControlFlow::Continue(())
            }
            Message::ErrorLog(args) => {
                console::replay_error(&self.id, &args);
                ControlFlow::Continue(())
            }
            Message::Input(_) => {
                self.violation(ProtocolViolation::new("INPUT frame sent by an isolate", frame));
                ControlFlow::Break(())
            }
        }
    }
}

/// Caller-side owner of an invocation. Dropping the last one terminates it.
pub(crate) struct Owner {
    invocation: Arc<Invocation>,
}

impl Owner {
    pub(crate) fn new(invocation: Arc<Invocation>) -> Self {
        Self { invocation }
    }

    pub(crate) fn invocation(&self) -> &Arc<Invocation> {
        &self.invocation
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        if !self.invocation.is_settled() {
            tracing::debug!(invocation = %self.invocation.id, "all handles dropped, terminating");
            self.invocation.terminate();
        }
    }
}

/// Settles with a fault if the pump stops before the invocation settled
struct PumpGuard(Arc<Invocation>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if !self.0.is_settled() {
            self.0.fault(IsolateFault::new(
                &self.0.name,
                "invocation controller stopped before the isolate settled",
            ));
        }
    }
}

/// Drain isolate events until the invocation settles or is released
async fn pump(invocation: Arc<Invocation>, mut events: mpsc::UnboundedReceiver<IsolateEvent>) {
    let _guard = PumpGuard(Arc::clone(&invocation));

    loop {
        let event = tokio::select! {
            biased;
            _ = invocation.released.notified() => break,
            event = events.recv() => event,
        };

        let flow = match event {
            Some(IsolateEvent::Frame(frame)) => invocation.handle_frame(&frame),
            Some(IsolateEvent::Fault(fault)) => {
                invocation.fault(fault);
                ControlFlow::Break(())
            }
            None => {
                invocation.fault(IsolateFault::new(
                    &invocation.name,
                    "isolate exited without settling",
                ));
                ControlFlow::Break(())
            }
        };

        if flow.is_break() {
            break;
        }
    }
}

/// Start one invocation of `program` on `host`
pub(crate) fn launch<I, O>(
    program: &Arc<Program>,
    host: &Arc<dyn IsolateHost>,
    name_prefix: &str,
    input: I,
) -> Promise<O>
where
    I: Serialize,
    O: DeserializeOwned + Send + 'static,
{
    let id = InvocationId::new();
    let name = format!("{name_prefix}-{}", id.short());
    let (invocation, settled) = Invocation::new(id, name);

    if let Err(err) = spawn_isolate(&invocation, program, host, input) {
        tracing::warn!(invocation = %invocation.id, error = %err, "invocation failed to launch");
        invocation.settle(Outcome::Rejected(err));
    }

    Promise::settling(invocation, settled)
}

fn spawn_isolate<I: Serialize>(
    invocation: &Arc<Invocation>,
    program: &Arc<Program>,
    host: &Arc<dyn IsolateHost>,
    input: I,
) -> InvocationResult<()> {
    let marshal = |err: serde_json::Error| {
        InvocationError::Marshal(format!("failed to encode input: {err}"))
    };
    let input = serde_json::to_value(input).map_err(marshal)?;
    let frame = Message::Input(input).encode().map_err(marshal)?;

    let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
        InvocationError::Fault(IsolateFault::new(
            &invocation.name,
            format!("no tokio runtime to drive the invocation: {err}"),
        ))
    })?;

    let (endpoint, link) = host::link();
    let isolate = host
        .spawn(Arc::clone(program), endpoint, &invocation.name)
        .map_err(|err| {
            InvocationError::Fault(IsolateFault::new(&invocation.name, err.to_string()))
        })?;

    invocation.listen(isolate, link.to_isolate, frame);
    runtime.spawn(pump(Arc::clone(invocation), link.events));
    Ok(())
}
