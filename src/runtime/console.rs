//! Log interception and replay
//!
//! Inside the isolate, `tracing` events raised by the computation are caught
//! by [`ConsoleLayer`] and shipped to the controller as `LOG` / `ERROR_LOG`
//! frames instead of reaching whatever subscriber the host installed. On the
//! controller side those frames are replayed onto the host's own `tracing`
//! facility under the `isoworker::console` target.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer, SubscriberExt};

use super::controller::InvocationId;
use super::host::Outbox;
use super::protocol::Message;

/// Target used when replaying isolate logs on the host
pub const CONSOLE_TARGET: &str = "isoworker::console";

/// Forwards every event to the controller as a log frame
pub(crate) struct ConsoleLayer {
    outbox: Outbox,
}

impl<S: Subscriber> Layer<S> for ConsoleLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = ArgsVisitor::default();
        event.record(&mut visitor);
        let args = visitor.into_args();

        let message = if *event.metadata().level() == Level::ERROR {
            Message::ErrorLog(args)
        } else {
            Message::Log(args)
        };
        self.outbox.send(&message);
    }
}

/// Dispatcher that routes isolate-side events through a [`ConsoleLayer`]
pub(crate) fn dispatch(outbox: Outbox) -> Dispatch {
    Dispatch::new(tracing_subscriber::registry().with(ConsoleLayer { outbox }))
}

#[derive(Default)]
struct ArgsVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl ArgsVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn into_args(self) -> Vec<Value> {
        let mut args = vec![Value::String(self.message.unwrap_or_default())];
        if !self.fields.is_empty() {
            args.push(Value::Object(self.fields));
        }
        args
    }
}

impl Visit for ArgsVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.record_value(field, Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.record_value(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, Value::from(value));
    }
}

/// Serialize log arguments, keeping unserializable ones as text
pub(crate) fn collect_args<A, T>(args: A) -> Vec<Value>
where
    A: IntoIterator<Item = T>,
    T: Serialize,
{
    args.into_iter()
        .map(|arg| {
            serde_json::to_value(&arg)
                .unwrap_or_else(|err| Value::String(format!("<unserializable: {err}>")))
        })
        .collect()
}

/// Render log arguments as a single line: strings verbatim, the rest as JSON
pub fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replay a `LOG` frame on the host
pub(crate) fn replay_log(invocation: &InvocationId, args: &[Value]) {
    tracing::info!(target: CONSOLE_TARGET, invocation = %invocation, "{}", render_args(args));
}

/// Replay an `ERROR_LOG` frame on the host
pub(crate) fn replay_error(invocation: &InvocationId, args: &[Value]) {
    tracing::error!(target: CONSOLE_TARGET, invocation = %invocation, "{}", render_args(args));
}
