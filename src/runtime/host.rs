//! Isolate hosts
//!
//! The controller only needs a small capability set from whatever runs the
//! isolate: spawn it from a [`Program`], move frames in both directions,
//! tear it down on demand, and report faults that happen outside the
//! message protocol. [`IsolateHost`] captures exactly that.
//!
//! Two hosts ship with the crate:
//! - [`ThreadHost`]: a dedicated OS thread with its own current-thread
//!   tokio runtime per invocation
//! - [`TaskHost`]: a tokio task on the caller's runtime

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::error::{HostError, IsolateFault};
use super::program::Program;
use super::protocol::Message;

/// Something the isolate sends back to its controller
#[derive(Debug)]
pub enum IsolateEvent {
    /// An encoded [`Message`]
    Frame(Vec<u8>),
    /// The isolate failed outside the protocol
    Fault(IsolateFault),
}

/// Which built-in host a factory uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    /// One OS thread per invocation
    #[default]
    Thread,
    /// One tokio task per invocation
    Task,
}

impl std::str::FromStr for HostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown isolate host '{other}'")),
        }
    }
}

/// Runs isolates on behalf of the controller
///
/// Termination goes through [`IsolateHandle::terminate`], which only has to
/// stop the isolate at its next opportunity. A host cannot reclaim code that
/// never yields; such an isolate keeps its resources until the computation
/// returns on its own.
pub trait IsolateHost: Send + Sync + 'static {
    /// Start an isolate that runs `program` against `endpoint`.
    ///
    /// The host must keep the endpoint inside the isolate and drop it when
    /// the isolate ends. Panics and other failures outside the protocol are
    /// reported through [`IsolateEndpoint::reporter`].
    fn spawn(
        &self,
        program: Arc<Program>,
        endpoint: IsolateEndpoint,
        name: &str,
    ) -> Result<Box<dyn IsolateHandle>, HostError>;
}

/// Controller-side handle used to tear an isolate down
pub trait IsolateHandle: Send {
    /// Forcibly release the isolate. Must be safe to call more than once.
    fn terminate(&mut self);
}

/// Isolate side of the link created for every invocation
pub struct IsolateEndpoint {
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    outbox: Outbox,
}

impl IsolateEndpoint {
    /// Wait for the next frame from the controller.
    ///
    /// Returns `None` once the controller has released the isolate.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbox.recv().await
    }

    /// Send a raw frame to the controller
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outbox.send_frame(frame)
    }

    /// Whether the controller has stopped listening
    pub fn is_detached(&self) -> bool {
        self.outbox.is_detached()
    }

    /// Handle a host keeps to report faults after the endpoint is gone
    pub fn reporter(&self) -> FaultReporter {
        FaultReporter {
            events: self.outbox.events.clone(),
        }
    }

    pub(crate) fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }
}

/// Reports isolate faults to the controller
#[derive(Clone)]
pub struct FaultReporter {
    events: mpsc::UnboundedSender<IsolateEvent>,
}

impl FaultReporter {
    /// Deliver a fault; ignored if the controller is gone
    pub fn report(&self, fault: IsolateFault) {
        let _ = self.events.send(IsolateEvent::Fault(fault));
    }
}

/// Encodes messages onto the isolate → controller channel
#[derive(Clone)]
pub(crate) struct Outbox {
    events: mpsc::UnboundedSender<IsolateEvent>,
}

impl Outbox {
    pub(crate) fn send(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(frame) => self.send_frame(frame),
            Err(err) => {
                tracing::warn!(
                    kind = %message.kind(),
                    error = %err,
                    "dropping unencodable message"
                );
                false
            }
        }
    }

    fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.events.send(IsolateEvent::Frame(frame)).is_ok()
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.events.is_closed()
    }
}

/// Controller side of the link
pub(crate) struct ControllerLink {
    pub(crate) to_isolate: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) events: mpsc::UnboundedReceiver<IsolateEvent>,
}

/// Create the two ends of a fresh isolate link
pub(crate) fn link() -> (IsolateEndpoint, ControllerLink) {
    let (to_isolate, inbox) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let endpoint = IsolateEndpoint {
        inbox,
        outbox: Outbox { events: events_tx },
    };
    (endpoint, ControllerLink { to_isolate, events })
}

/// Runs each isolate on its own OS thread
///
/// On terminate the isolate's runtime drops the computation at its next
/// `.await`. Blocking code is not interrupted: a computation that never
/// checks [`Context::is_detached`](super::program::Context::is_detached)
/// keeps its thread busy after the invocation settled, possibly forever.
///
/// Panics in the computation become faults, but they still go through the
/// process panic hook first, so the default hook prints them to stderr.
#[derive(Debug, Clone, Default)]
pub struct ThreadHost {
    stack_size: Option<usize>,
}

impl ThreadHost {
    /// Create a thread host with the platform's default stack size
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the stack size of isolate threads
    pub fn with_stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl IsolateHost for ThreadHost {
    fn spawn(
        &self,
        program: Arc<Program>,
        endpoint: IsolateEndpoint,
        name: &str,
    ) -> Result<Box<dyn IsolateHandle>, HostError> {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let reporter = endpoint.reporter();
        let label = name.to_string();

        let mut builder = std::thread::Builder::new().name(label.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        builder.spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    reporter.report(IsolateFault::new(
                        &label,
                        format!("failed to build isolate runtime: {err}"),
                    ));
                    return;
                }
            };

            runtime.block_on(async move {
                let run = AssertUnwindSafe(program.run(endpoint)).catch_unwind();
                tokio::select! {
                    outcome = run => {
                        if let Err(panic) = outcome {
                            reporter.report(IsolateFault::from_panic(&label, panic));
                        }
                    }
                    _ = kill_rx => {
                        tracing::debug!(isolate = %label, "isolate torn down");
                    }
                }
            });
        })?;

        Ok(Box::new(ThreadIsolate {
            kill: Some(kill_tx),
        }))
    }
}

struct ThreadIsolate {
    kill: Option<oneshot::Sender<()>>,
}

impl IsolateHandle for ThreadIsolate {
    fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Runs each isolate as a task on the caller's tokio runtime.
///
/// Blocking computations stall a runtime worker; prefer [`ThreadHost`] for
/// them. Termination aborts the task at its next `.await`, and panics pass
/// through the process panic hook before becoming faults, as with
/// [`ThreadHost`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskHost;

impl IsolateHost for TaskHost {
    fn spawn(
        &self,
        program: Arc<Program>,
        endpoint: IsolateEndpoint,
        name: &str,
    ) -> Result<Box<dyn IsolateHandle>, HostError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| HostError::Runtime(err.to_string()))?;
        let reporter = endpoint.reporter();
        let label = name.to_string();

        let task = runtime.spawn(async move { program.run(endpoint).await });
        let abort = task.abort_handle();

        // Watches the isolate task so panics become faults instead of
        // surfacing on the host runtime.
        runtime.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    reporter.report(IsolateFault::from_panic(&label, err.into_panic()));
                } else {
                    tracing::debug!(isolate = %label, "isolate torn down");
                }
            }
        });

        Ok(Box::new(TaskIsolate { abort }))
    }
}

struct TaskIsolate {
    abort: tokio::task::AbortHandle,
}

impl IsolateHandle for TaskIsolate {
    fn terminate(&mut self) {
        self.abort.abort();
    }
}

impl Drop for TaskIsolate {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
