//! Isoworker CLI - run demo computations in isolated workers
//!
//! Each subcommand builds a factory around a small computation, invokes it
//! once and prints every notification followed by the outcome.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use isoworker::{Context, Factory, HostKind, InvocationResult, Program, Promise, WorkerConfig};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "isoworker")]
#[command(about = "Run computations in isolated workers", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults to ISOWORKER_* environment variables)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Isolate host: thread or task
    #[arg(long)]
    host: Option<HostKind>,

    /// Terminate the invocation after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a constant to a number
    Add {
        /// Number to start from
        value: i64,

        /// Constant to add
        #[arg(long, default_value = "2")]
        amount: i64,
    },

    /// Reject with a message
    Fail {
        /// Rejection message
        #[arg(long, default_value = "aaah")]
        message: String,
    },

    /// Count down, notifying on every tick
    Countdown {
        /// Starting count
        #[arg(default_value = "5")]
        from: u32,

        /// Delay between ticks in milliseconds
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },

    /// Busy-loop until terminated
    Spin,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => WorkerConfig::from_env()?,
    };
    if let Some(host) = cli.host {
        config.host = host;
    }

    match cli.command {
        Commands::Add { value, amount } => {
            let program = Program::from_fn("add", move |x: i64, _cx: &Context| Ok(x + amount));
            run::<i64, i64>(program, config, value, cli.timeout_ms).await
        }
        Commands::Fail { message } => {
            let program = Program::from_fn("fail", |message: String, _cx: &Context| {
                Err::<(), _>(anyhow::anyhow!(message))
            });
            run::<String, ()>(program, config, message, cli.timeout_ms).await
        }
        Commands::Countdown { from, interval_ms } => {
            let countdown = move |from: u32, cx: Context| async move {
                for n in (1..=from).rev() {
                    cx.notify(&n)?;
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                tracing::info!(from, "countdown finished");
                Ok::<_, anyhow::Error>("liftoff".to_string())
            };
            let program = Program::from_async("countdown", countdown);
            run::<u32, String>(program, config, from, cli.timeout_ms).await
        }
        Commands::Spin => {
            let program = Program::from_fn("spin", |_: (), cx: &Context| {
                let mut turns: u64 = 0;
                while !cx.is_detached() {
                    turns = turns.wrapping_add(1);
                    std::hint::spin_loop();
                }
                Ok(turns)
            });
            run::<(), u64>(program, config, (), cli.timeout_ms).await
        }
    }
}

async fn run<I, O>(
    program: Program,
    config: WorkerConfig,
    input: I,
    timeout_ms: Option<u64>,
) -> Result<()>
where
    I: Serialize,
    O: DeserializeOwned + Serialize + Send + 'static,
{
    let factory: Factory<I, O> = Factory::new(program, config);
    let promise = factory.invoke(input);
    let _subscription = promise.notify(|value| println!("notify: {value}"));

    if let Some(ms) = timeout_ms {
        let handle = promise.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            handle.terminate();
        });
    }

    report(promise).await
}

async fn report<O: Serialize + Send + 'static>(promise: Promise<O>) -> Result<()> {
    let id = promise.id();
    let outcome: InvocationResult<O> = promise.await;
    match outcome {
        Ok(value) => {
            println!("{id} resolved: {}", serde_json::to_string(&value)?);
            Ok(())
        }
        Err(err) => anyhow::bail!("{id} rejected: {err}"),
    }
}
