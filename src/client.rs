//! Facades for the editor layer.
//!
//! Each facade pairs a [`ProcessSupervisor`] with a fresh adapter per
//! worker run:
//! 1. `start(env)` spawns the worker and waits for readiness
//! 2. request methods go through the adapter's client half
//! 3. `dispose()` says goodbye on the worker's stdin and kills it
//!
//! `start` is a no-op while the worker is connected. After the worker has
//! gone away, the next `start` respawns it.
//!
//! # Example
//!
//! ```ignore
//! use sockwire::{CompletionCommand, CompletionServer, WorkerConfig};
//!
//! let mut server = CompletionServer::new(WorkerConfig::new("python3", "completion.py"));
//! server.start(&Default::default()).await?;
//!
//! let items = server
//!     .get_result(CompletionCommand::Completions, None, "a.py", 4, 0, "import o")
//!     .await?;
//! server.dispose().await;
//! ```

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::completion::{completion_adapter, CompletionClient, CompletionCommand};
use crate::adapter::kernel::{
    find_kernel_spec, kernel_adapter, ExecutionStream, KernelClient, KernelSpecMetadata, StartedKernel,
};
use crate::adapter::AdapterEvents;
use crate::error::{Result, SockwireError};
use crate::handler::Handshake;
use crate::supervisor::{ProcessSupervisor, WorkerConfig};

/// Completion server worker.
pub struct CompletionServer {
    supervisor: ProcessSupervisor,
    client: Option<CompletionClient>,
    events: Option<AdapterEvents>,
}

impl CompletionServer {
    /// A completion server launched with `config` on first `start`.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            client: None,
            events: None,
        }
    }

    /// Start the worker unless it is already serving.
    ///
    /// # Errors
    ///
    /// See [`ProcessSupervisor::start`].
    pub async fn start(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if self.client.as_ref().is_some_and(CompletionClient::is_connected) {
            return Ok(());
        }
        self.supervisor.dispose(None).await;

        let (client, dispatcher, events) = completion_adapter();
        self.supervisor.start(dispatcher, env).await?;
        self.client = Some(client);
        self.events = Some(events);
        Ok(())
    }

    /// The request half of the current adapter, cheap to clone.
    ///
    /// # Errors
    ///
    /// `NotStarted` before the first successful `start`.
    pub fn client(&self) -> Result<&CompletionClient> {
        self.client.as_ref().ok_or(SockwireError::NotStarted)
    }

    /// Notifications of the current adapter, once per start.
    pub fn take_events(&mut self) -> Option<AdapterEvents> {
        self.events.take()
    }

    /// Handshake of the running worker.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.supervisor.handshake()
    }

    /// Ask for `command` at `(line, column)` of `file`.
    pub async fn get_result(
        &self,
        command: CompletionCommand,
        token: Option<CancellationToken>,
        file: &str,
        column: i32,
        line: i32,
        source: &str,
    ) -> Result<Value> {
        self.client()?
            .get_result(command, token, file, column, line, source)
            .await
    }

    /// Round-trip `message` through the worker.
    pub async fn ping(&self, message: &str) -> Result<String> {
        self.client()?.ping(message).await
    }

    /// Stop the worker. Idempotent.
    pub async fn dispose(&mut self) {
        self.supervisor.dispose(Some("")).await;
        self.client = None;
        self.events = None;
    }
}

/// Kernel server worker.
pub struct JupyterClient {
    supervisor: ProcessSupervisor,
    client: Option<KernelClient>,
    events: Option<AdapterEvents>,
    last_started_kernel: Option<String>,
}

impl JupyterClient {
    /// A kernel server launched with `config` on first `start`.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config),
            client: None,
            events: None,
            last_started_kernel: None,
        }
    }

    /// Start the worker unless it is already serving.
    ///
    /// # Errors
    ///
    /// See [`ProcessSupervisor::start`].
    pub async fn start(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if self.client.as_ref().is_some_and(KernelClient::is_connected) {
            return Ok(());
        }
        self.supervisor.dispose(None).await;

        let (client, dispatcher, events) = kernel_adapter();
        self.supervisor.start(dispatcher, env).await?;
        self.client = Some(client);
        self.events = Some(events);
        Ok(())
    }

    /// The request half of the current adapter, cheap to clone.
    ///
    /// # Errors
    ///
    /// `NotStarted` before the first successful `start`.
    pub fn client(&self) -> Result<&KernelClient> {
        self.client.as_ref().ok_or(SockwireError::NotStarted)
    }

    /// Notifications of the current adapter, once per start.
    pub fn take_events(&mut self) -> Option<AdapterEvents> {
        self.events.take()
    }

    /// Handshake of the running worker.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.supervisor.handshake()
    }

    /// Uuid of the kernel most recently started through this facade.
    pub fn last_started_kernel(&self) -> Option<&str> {
        self.last_started_kernel.as_deref()
    }

    /// Round-trip `message` through the worker.
    pub async fn ping(&self, message: &str) -> Result<String> {
        self.client()?.ping(message).await
    }

    /// Installed kernel specs, keyed by spec name.
    pub async fn list_kernel_specs(&self) -> Result<Value> {
        self.client()?.list_kernel_specs().await
    }

    /// Start the kernel whose spec has `spec.display_name`.
    ///
    /// # Errors
    ///
    /// `KernelSpecNotFound` if no installed spec has that display name.
    pub async fn start_kernel(&mut self, spec: &KernelSpecMetadata) -> Result<StartedKernel> {
        let client = self.client()?.clone();
        let specs = client.list_kernel_specs().await?;
        let name = find_kernel_spec(&specs, &spec.display_name)
            .ok_or_else(|| SockwireError::KernelSpecNotFound(spec.display_name.clone()))?;

        let started = client.start_kernel_by_name(name).await?;
        tracing::info!(kernel = %started.uuid, spec = name, "kernel started");
        self.last_started_kernel = Some(started.uuid.clone());
        Ok(started)
    }

    /// Interrupt the cell running on kernel `uuid`.
    pub async fn interrupt_kernel(&self, uuid: &str) -> Result<()> {
        self.client()?.interrupt_kernel(uuid).await
    }

    /// Restart kernel `uuid`, failing work in flight.
    pub async fn restart_kernel(&self, uuid: &str) -> Result<()> {
        self.client()?.restart_kernel(uuid).await
    }

    /// Shut down kernel `uuid`, failing work in flight.
    pub async fn shutdown_kernel(&self, uuid: &str) -> Result<()> {
        self.client()?.shutdown_kernel(uuid).await
    }

    /// Execute `code` on the current kernel.
    pub fn run_code(&self, code: &str) -> Result<ExecutionStream> {
        self.client()?.run_code(code)
    }

    /// Stop the worker, naming the last started kernel on its stdin so it
    /// can shut that kernel down. Idempotent.
    pub async fn dispose(&mut self) {
        let farewell = self.last_started_kernel.take().unwrap_or_default();
        self.supervisor.dispose(Some(&farewell)).await;
        self.client = None;
        self.events = None;
    }
}
