//! Factories and configuration
//!
//! A [`Factory`] is built once from a user function. Each call to
//! [`Factory::invoke`] spawns a fresh isolate, hands it the input and
//! returns a [`Promise`] for the outcome.

use std::env;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// Submodules
pub mod console;
pub mod controller;
pub mod error;
pub mod host;
pub mod program;
pub mod promise;
pub mod protocol;

use error::{ConfigError, ConfigResult};
use host::{HostKind, IsolateHost, TaskHost, ThreadHost};

/// Configuration for a factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Which built-in host runs the isolates
    pub host: HostKind,

    /// Prefix of isolate names (and thread names for the thread host)
    pub thread_name: String,

    /// Stack size of isolate threads, in bytes
    pub stack_size: Option<usize>,

    /// Forward `tracing` events raised inside the isolate as log frames
    pub capture_tracing: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: HostKind::Thread,
            thread_name: "isoworker".to_string(),
            stack_size: None,
            capture_tracing: true,
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by `ISOWORKER_*` environment variables.
    ///
    /// Blank values are ignored; values that do not parse are errors.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let invalid = |key: &str, value: &str| ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };

        let mut config = Self::default();
        if let Some(value) = read("ISOWORKER_HOST") {
            config.host = value.parse().map_err(|_| invalid("ISOWORKER_HOST", &value))?;
        }
        if let Some(value) = read("ISOWORKER_THREAD_NAME") {
            config.thread_name = value;
        }
        if let Some(value) = read("ISOWORKER_STACK_SIZE") {
            let size = value
                .parse::<usize>()
                .map_err(|_| invalid("ISOWORKER_STACK_SIZE", &value))?;
            config.stack_size = Some(size);
        }
        if let Some(value) = read("ISOWORKER_CAPTURE_TRACING") {
            config.capture_tracing = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid("ISOWORKER_CAPTURE_TRACING", &value)),
            };
        }
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let data = std::fs::read(path)?;
        let config = serde_json::from_slice(&data)?;
        Ok(config)
    }

    /// Write configuration to a JSON file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn build_host(&self) -> Arc<dyn IsolateHost> {
        match self.host {
            HostKind::Thread => Arc::new(ThreadHost::new().with_stack_size(self.stack_size)),
            HostKind::Task => Arc::new(TaskHost),
        }
    }
}

/// Invocable built once from a user function
pub struct Factory<I, O> {
    program: Arc<program::Program>,
    host: Arc<dyn IsolateHost>,
    config: WorkerConfig,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Factory<I, O>
where
    I: Serialize,
    O: DeserializeOwned + Send + 'static,
{
    /// Create a factory from a program and configuration
    pub fn new(program: program::Program, config: WorkerConfig) -> Self {
        let program = program.capture_tracing(config.capture_tracing);
        Self {
            program: Arc::new(program),
            host: config.build_host(),
            config,
            _marker: PhantomData,
        }
    }

    /// Run isolates on a custom host instead of the configured one
    pub fn with_host(mut self, host: impl IsolateHost) -> Self {
        self.host = Arc::new(host);
        self
    }

    /// Start one invocation.
    ///
    /// Spawns a fresh isolate immediately; the input is delivered when the
    /// returned promise is first polled or started. Must be called from
    /// within a tokio runtime, otherwise the promise rejects with a fault.
    pub fn invoke(&self, input: I) -> promise::Promise<O> {
        controller::launch(&self.program, &self.host, &self.config.thread_name, input)
    }

    /// Configuration this factory was built with
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The program every isolate runs
    pub fn program(&self) -> &program::Program {
        &self.program
    }
}

impl<I, O> Clone for Factory<I, O> {
    fn clone(&self) -> Self {
        Self {
            program: Arc::clone(&self.program),
            host: Arc::clone(&self.host),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Factory<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("program", &self.program)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Build a factory from an async function, with default configuration
pub fn create<I, O, F, Fut>(f: F) -> Factory<I, O>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(I, program::Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    let config = WorkerConfig::default();
    let program = program::Program::from_async(config.thread_name.clone(), f);
    Factory::new(program, config)
}

/// Build a factory from a blocking function, with default configuration
pub fn create_fn<I, O, F>(f: F) -> Factory<I, O>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(I, &program::Context) -> anyhow::Result<O> + Send + Sync + 'static,
{
    let config = WorkerConfig::default();
    let program = program::Program::from_fn(config.thread_name.clone(), f);
    Factory::new(program, config)
}

// Re-export commonly used types
pub use controller::{InvocationId, Phase};
pub use error::{Failure, InvocationError, InvocationResult, IsolateFault};
pub use program::{Context, Program};
pub use promise::{InvocationHandle, Promise, Subscription, WeakInvocationHandle};
