//! Isolate bootstrap program
//!
//! A [`Program`] is the unit an isolate host loads. It is a small harness
//! parameterised by the user function: it waits for the single `INPUT`
//! frame, runs the function with that input and a [`Context`], and answers
//! with exactly one `RESOLVE` or `REJECT`. Every error on the isolate side
//! (input decoding, the computation, output encoding, stray frames) becomes
//! a `REJECT`; only panics escape, and the host reports those as faults.
//!
//! The user function sees nothing but its arguments. Its input and the
//! context are passed in explicitly, and the `'static + Send + Sync` bounds
//! keep it from borrowing anything owned by the caller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::instrument::WithSubscriber;

use super::console;
use super::error::Failure;
use super::host::{IsolateEndpoint, Outbox};
use super::protocol::Message;

type Entry = dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync;

/// Self-contained program run inside an isolate
pub struct Program {
    label: String,
    entry: Box<Entry>,
    capture_tracing: bool,
}

impl Program {
    /// Build a program from an async function
    pub fn from_async<I, O, F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    {
        let f = Arc::new(f);
        let entry = move |input: Value, cx: Context| {
            let f = Arc::clone(&f);
            async move {
                let input: I = decode_input(input)?;
                let output = f(input, cx).await.map_err(Failure::from)?;
                encode_output(&output)
            }
            .boxed()
        };
        Self::with_entry(label, Box::new(entry))
    }

    /// Build a program from a blocking function
    pub fn from_fn<I, O, F>(label: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, &Context) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let entry = move |input: Value, cx: Context| {
            let f = Arc::clone(&f);
            async move {
                let input: I = decode_input(input)?;
                let output = f(input, &cx).map_err(Failure::from)?;
                encode_output(&output)
            }
            .boxed()
        };
        Self::with_entry(label, Box::new(entry))
    }

    fn with_entry(label: impl Into<String>, entry: Box<Entry>) -> Self {
        Self {
            label: label.into(),
            entry,
            capture_tracing: true,
        }
    }

    /// Choose whether `tracing` events raised by the computation are
    /// forwarded to the controller as log frames
    pub fn capture_tracing(mut self, capture: bool) -> Self {
        self.capture_tracing = capture;
        self
    }

    /// Program label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether isolate-side `tracing` events are forwarded
    pub fn captures_tracing(&self) -> bool {
        self.capture_tracing
    }

    /// Run the harness until the invocation settles or the controller
    /// goes away
    pub async fn run(&self, mut endpoint: IsolateEndpoint) {
        let Some(frame) = endpoint.recv().await else {
            tracing::debug!(program = %self.label, "released before receiving input");
            return;
        };

        let outbox = endpoint.outbox();
        let reply = match Message::decode(&frame) {
            Ok(Message::Input(input)) => self.evaluate(input, &outbox).await,
            Ok(other) => Message::Reject(Failure::new(format!(
                "expected INPUT frame, received {}",
                other.kind()
            ))),
            Err(violation) => Message::Reject(Failure::new(violation.to_string())),
        };
        outbox.send(&reply);
    }

    async fn evaluate(&self, input: Value, outbox: &Outbox) -> Message {
        let cx = Context {
            outbox: outbox.clone(),
        };
        let computation = (self.entry)(input, cx);
        let result = if self.capture_tracing {
            computation
                .with_subscriber(console::dispatch(outbox.clone()))
                .await
        } else {
            computation.await
        };

        match result {
            Ok(value) => Message::Resolve(value),
            Err(failure) => Message::Reject(failure),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("label", &self.label)
            .field("capture_tracing", &self.capture_tracing)
            .finish_non_exhaustive()
    }
}

fn decode_input<I: DeserializeOwned>(input: Value) -> Result<I, Failure> {
    serde_json::from_value(input)
        .map_err(|err| Failure::new(format!("failed to decode input: {err}")))
}

fn encode_output<O: Serialize>(output: &O) -> Result<Value, Failure> {
    serde_json::to_value(output)
        .map_err(|err| Failure::new(format!("failed to encode output: {err}")))
}

/// Everything a computation can reach from inside its isolate
#[derive(Clone)]
pub struct Context {
    outbox: Outbox,
}

impl Context {
    /// Send a notification to every subscriber of the invocation.
    ///
    /// Fails when the value cannot be serialized or the controller has
    /// already released the isolate, so long-running loops can stop with `?`.
    pub fn notify<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)?;
        if !self.outbox.send(&Message::Notify(value)) {
            anyhow::bail!("invocation was released by its controller");
        }
        Ok(())
    }

    /// Forward log arguments to the host
    pub fn log<A, T>(&self, args: A)
    where
        A: IntoIterator<Item = T>,
        T: Serialize,
    {
        self.outbox.send(&Message::Log(console::collect_args(args)));
    }

    /// Forward error-log arguments to the host
    pub fn error<A, T>(&self, args: A)
    where
        A: IntoIterator<Item = T>,
        T: Serialize,
    {
        self.outbox.send(&Message::ErrorLog(console::collect_args(args)));
    }

    /// Whether the controller has released this isolate.
    ///
    /// Blocking computations cannot be preempted; they should poll this and
    /// return once it turns true.
    pub fn is_detached(&self) -> bool {
        self.outbox.is_detached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::{IsolateEvent, link};
    use serde_json::json;

    async fn run_once(program: Program, input: Value) -> Vec<Message> {
        let (endpoint, mut controller) = link();
        let frame = Message::Input(input).encode().unwrap();
        controller.to_isolate.send(frame).unwrap();
        program.run(endpoint).await;

        let mut messages = Vec::new();
        while let Some(event) = controller.events.recv().await {
            match event {
                IsolateEvent::Frame(frame) => messages.push(Message::decode(&frame).unwrap()),
                IsolateEvent::Fault(fault) => panic!("unexpected fault: {fault}"),
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_resolves_with_output() {
        let program = Program::from_fn("add", |input: i64, _cx: &Context| Ok(input + 2));
        let messages = run_once(program, json!(3)).await;
        assert_eq!(messages, vec![Message::Resolve(json!(5))]);
    }

    #[tokio::test]
    async fn test_error_becomes_reject() {
        let program = Program::from_async("fail", |_: (), _cx| async move {
            Err::<(), _>(anyhow::anyhow!("aaah"))
        });
        let messages = run_once(program, Value::Null).await;
        assert_eq!(messages, vec![Message::Reject(Failure::new("aaah"))]);
    }

    #[tokio::test]
    async fn test_bad_input_becomes_reject() {
        let program = Program::from_fn("add", |input: i64, _cx: &Context| Ok(input + 2));
        let messages = run_once(program, json!("three")).await;
        match messages.as_slice() {
            [Message::Reject(failure)] => {
                assert!(failure.message.starts_with("failed to decode input"))
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notifications_precede_terminal_message() {
        let program = Program::from_fn("notify", |_: (), cx: &Context| {
            cx.notify(&"a")?;
            cx.log(["halfway"]);
            cx.notify(&"b")?;
            Ok(1)
        });
        let messages = run_once(program, Value::Null).await;
        assert_eq!(
            messages,
            vec![
                Message::Notify(json!("a")),
                Message::Log(vec![json!("halfway")]),
                Message::Notify(json!("b")),
                Message::Resolve(json!(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_tracing_is_captured_as_log_frames() {
        let program = Program::from_fn("traced", |_: (), _cx: &Context| {
            tracing::info!("working");
            tracing::error!(code = 7, "went wrong");
            Ok(())
        });
        let messages = run_once(program, Value::Null).await;
        assert_eq!(
            messages,
            vec![
                Message::Log(vec![json!("working")]),
                Message::ErrorLog(vec![json!("went wrong"), json!({ "code": 7 })]),
                Message::Resolve(Value::Null),
            ]
        );
    }

    #[tokio::test]
    async fn test_tracing_capture_can_be_disabled() {
        let program = Program::from_fn("quiet", |_: (), _cx: &Context| {
            tracing::info!("working");
            Ok(())
        })
        .capture_tracing(false);
        let messages = run_once(program, Value::Null).await;
        assert_eq!(messages, vec![Message::Resolve(Value::Null)]);
    }

    #[tokio::test]
    async fn test_stray_frame_becomes_reject() {
        let (endpoint, mut controller) = link();
        controller
            .to_isolate
            .send(Message::Notify(json!(1)).encode().unwrap())
            .unwrap();
        let program = Program::from_fn("add", |input: i64, _cx: &Context| Ok(input));
        program.run(endpoint).await;

        match controller.events.recv().await {
            Some(IsolateEvent::Frame(frame)) => {
                assert!(matches!(Message::decode(&frame).unwrap(), Message::Reject(_)))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exits_quietly_when_released_before_input() {
        let (endpoint, controller) = link();
        drop(controller.to_isolate);
        let program = Program::from_fn("add", |input: i64, _cx: &Context| Ok(input));
        program.run(endpoint).await;
    }
}
