//! Isoworker – run a computation in an isolated worker and await it as a future
//!
//! A user function is wrapped into a [`Factory`]. Every invocation spawns a
//! fresh isolate (its own thread and runtime by default), ships the input
//! across as a JSON frame and returns a [`Promise`] that:
//! - settles exactly once with the computation's result or error
//! - can be terminated, rejecting with `WORKER_TERMINATED`
//! - delivers out-of-band notifications to subscribers
//! - keeps both capabilities through `then`, `map`, `catch` and friends
//!
//! Logs raised inside the isolate are replayed on the host's `tracing`
//! subscriber under the `isoworker::console` target.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Isolates, the invocation controller and the promise wrapper
pub mod runtime;

// Re-export key types for convenience
pub use runtime::console::CONSOLE_TARGET;
pub use runtime::error::{
    Failure, InvocationError, InvocationResult, IsolateFault, TERMINATED_MESSAGE,
};
pub use runtime::host::{HostKind, IsolateHost, TaskHost, ThreadHost};
pub use runtime::{
    Context, Factory, InvocationHandle, InvocationId, Phase, Program, Promise, Subscription,
    WeakInvocationHandle, WorkerConfig, create, create_fn,
};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
