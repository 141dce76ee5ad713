//! Kernel-server adapter.
//!
//! Request frames (worker-bound):
//! ```text
//! ping           : String(id) String(message)
//! lsks           : String(id)
//! strk           : String(id) String(kernel name)
//! itpk|rstk|stpk : String(id) String(kernel uuid)
//! run            : String(id) String(code)
//! ```
//! Response frames:
//! ```text
//! PONG           : String(id) String(message)
//! LSKS           : String(id) String(json specs)
//! STRK           : String(id) String(uuid) String(json config) String(connection file)
//! ITPK|RSTK|STPK : String(id)
//! RUN            : String(id) String(msg_id)
//! SHEL           : String(json shell message)
//! IOPB           : String(json iopub message)
//! EROR           : String(command) String(id) String(trace)
//! ```

mod execution;
pub mod messages;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use execution::ExecutionStream;
pub use messages::{parse_io_message, shell_status, JupyterMessage, ParsedIoMessage};

use super::{read_error_frame, read_strings, AdapterEvent, AdapterEvents, Channel, Core, ERROR_TAG};
use crate::codec::JsonCodec;
use crate::error::{Result, SockwireError};
use crate::handler::{CloseReason, Dispatch, Dispatched, Handshake};
use crate::protocol::{ByteStream, FrameBuilder, Tag};
use crate::writer::WriterHandle;
use execution::{lock, SharedExecutions};

const PING_TAG: Tag = Tag::new(*b"ping");
const LIST_SPECS_TAG: Tag = Tag::new(*b"lsks");
const START_KERNEL_TAG: Tag = Tag::new(*b"strk");
const RUN_CODE_TAG: Tag = Tag::new(*b"run ");

const PONG_TAG: Tag = Tag::new(*b"PONG");
const SPECS_LISTED_TAG: Tag = Tag::new(*b"LSKS");
const KERNEL_STARTED_TAG: Tag = Tag::new(*b"STRK");
const INTERRUPTED_TAG: Tag = Tag::new(*b"ITPK");
const RESTARTED_TAG: Tag = Tag::new(*b"RSTK");
const SHUT_DOWN_TAG: Tag = Tag::new(*b"STPK");
const CODE_ACCEPTED_TAG: Tag = Tag::new(*b"RUN ");
const SHELL_TAG: Tag = Tag::new(*b"SHEL");
const IOPUB_TAG: Tag = Tag::new(*b"IOPB");

/// Lifecycle command for a running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelCommand {
    /// Interrupt the running cell.
    Interrupt,
    /// Restart the kernel process.
    Restart,
    /// Shut the kernel down.
    Shutdown,
}

impl KernelCommand {
    /// The worker-bound tag.
    pub const fn tag(self) -> Tag {
        match self {
            KernelCommand::Interrupt => Tag::new(*b"itpk"),
            KernelCommand::Restart => Tag::new(*b"rstk"),
            KernelCommand::Shutdown => Tag::new(*b"stpk"),
        }
    }

    /// Error handed to work the command invalidates.
    fn invalidation(self) -> Option<fn() -> SockwireError> {
        match self {
            KernelCommand::Interrupt => None,
            KernelCommand::Restart => Some(|| SockwireError::KernelRestarted),
            KernelCommand::Shutdown => Some(|| SockwireError::KernelShutdown),
        }
    }
}

impl fmt::Display for KernelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelCommand::Interrupt => "interrupt",
            KernelCommand::Restart => "restart",
            KernelCommand::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A kernel the worker started.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedKernel {
    /// Worker-side kernel id.
    pub uuid: String,
    /// Kernel configuration as reported by the kernel manager.
    pub config: Value,
    /// Path of the kernel's connection file.
    pub connection_file: String,
}

/// What the UI knows about a kernel spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecMetadata {
    #[serde(default)]
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Find the spec name whose `spec.display_name` is `display_name` in a
/// `lsks` listing.
pub fn find_kernel_spec<'a>(specs: &'a Value, display_name: &str) -> Option<&'a str> {
    specs.as_object()?.iter().find_map(|(name, entry)| {
        let shown = entry.get("spec")?.get("display_name")?.as_str()?;
        (shown == display_name).then_some(name.as_str())
    })
}

/// Reply decoded for a kernel request.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelReply {
    Pong(String),
    KernelSpecs(Value),
    Started(StartedKernel),
    /// Interrupt, restart or shutdown finished.
    Completed,
    /// Code was queued under this kernel `msg_id`.
    CodeAccepted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    Pong,
    SpecsListed,
    KernelStarted,
    CommandCompleted,
    CodeAccepted,
    Message(Channel),
    Error,
}

impl Response {
    fn from_tag(tag: Tag) -> Option<Self> {
        match tag {
            PONG_TAG => Some(Response::Pong),
            SPECS_LISTED_TAG => Some(Response::SpecsListed),
            KERNEL_STARTED_TAG => Some(Response::KernelStarted),
            INTERRUPTED_TAG | RESTARTED_TAG | SHUT_DOWN_TAG => Some(Response::CommandCompleted),
            CODE_ACCEPTED_TAG => Some(Response::CodeAccepted),
            SHELL_TAG => Some(Response::Message(Channel::Shell)),
            IOPUB_TAG => Some(Response::Message(Channel::IoPub)),
            ERROR_TAG => Some(Response::Error),
            _ => None,
        }
    }
}

/// Create a kernel adapter.
pub fn kernel_adapter() -> (KernelClient, KernelDispatcher, AdapterEvents) {
    let (core, events) = Core::new();
    let executions = SharedExecutions::default();
    (
        KernelClient {
            core: core.clone(),
            executions: executions.clone(),
        },
        KernelDispatcher { core, executions },
        events,
    )
}

fn unexpected<T>(request: &'static str) -> Result<T> {
    Err(SockwireError::UnexpectedReply(request))
}

/// Request side of the kernel adapter.
#[derive(Clone)]
pub struct KernelClient {
    core: Arc<Core<KernelReply>>,
    executions: SharedExecutions,
}

impl KernelClient {
    /// Round-trip `message` through the worker.
    pub fn ping(&self, message: &str) -> impl Future<Output = Result<String>> + Send + 'static {
        let pending = self.core.issue(|id| {
            FrameBuilder::command(PING_TAG)
                .write_string(id)
                .write_string(message)
                .finish()
        });
        async move {
            match pending?.await? {
                KernelReply::Pong(message) => Ok(message),
                _ => unexpected("ping"),
            }
        }
    }

    /// Kernel specs installed on the worker's side, keyed by spec name.
    pub fn list_kernel_specs(&self) -> impl Future<Output = Result<Value>> + Send + 'static {
        let pending = self
            .core
            .issue(|id| FrameBuilder::command(LIST_SPECS_TAG).write_string(id).finish());
        async move {
            match pending?.await? {
                KernelReply::KernelSpecs(specs) => Ok(specs),
                _ => unexpected("list kernel specs"),
            }
        }
    }

    /// Start the kernel spec called `name`.
    pub fn start_kernel_by_name(&self, name: &str) -> impl Future<Output = Result<StartedKernel>> + Send + 'static {
        let pending = self.core.issue(|id| {
            FrameBuilder::command(START_KERNEL_TAG)
                .write_string(id)
                .write_string(name)
                .finish()
        });
        async move {
            match pending?.await? {
                KernelReply::Started(kernel) => Ok(kernel),
                _ => unexpected("start kernel"),
            }
        }
    }

    /// Send a lifecycle command for kernel `uuid`.
    ///
    /// Restart and shutdown invalidate everything else in flight: every
    /// other pending request is rejected and every open execution stream
    /// fails, with `KernelRestarted` or `KernelShutdown`.
    pub fn send_kernel_command(
        &self,
        uuid: &str,
        command: KernelCommand,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let pending = self.core.issue(|id| {
            FrameBuilder::command(command.tag())
                .write_string(id)
                .write_string(uuid)
                .finish()
        });

        if let (Ok(pending), Some(error)) = (&pending, command.invalidation()) {
            let failed = lock(&self.executions).fail_all(error);
            let rejected = self
                .core
                .with_table(|table| table.reject_all_except(pending.id(), error));
            tracing::info!(%command, kernel = uuid, rejected, failed, "invalidated in-flight kernel work");
        }

        async move {
            match pending?.await? {
                KernelReply::Completed => Ok(()),
                _ => unexpected("kernel command"),
            }
        }
    }

    /// Interrupt the cell running on kernel `uuid`.
    pub fn interrupt_kernel(&self, uuid: &str) -> impl Future<Output = Result<()>> + Send + 'static {
        self.send_kernel_command(uuid, KernelCommand::Interrupt)
    }

    /// Restart kernel `uuid`.
    pub fn restart_kernel(&self, uuid: &str) -> impl Future<Output = Result<()>> + Send + 'static {
        self.send_kernel_command(uuid, KernelCommand::Restart)
    }

    /// Shut down kernel `uuid`.
    pub fn shutdown_kernel(&self, uuid: &str) -> impl Future<Output = Result<()>> + Send + 'static {
        self.send_kernel_command(uuid, KernelCommand::Shutdown)
    }

    /// Execute `code` on the current kernel.
    ///
    /// # Errors
    ///
    /// `NotConnected`/`ConnectionClosed` if the request cannot be sent.
    /// Later failures arrive through the stream.
    pub fn run_code(&self, code: &str) -> Result<ExecutionStream> {
        // Registration and send happen under the routing lock so the
        // `RUN ` reply cannot be routed before the execution exists.
        let mut executions = lock(&self.executions);
        let mut registered = None;
        let pending = self.core.issue(|id| {
            registered = Some(executions.register(id));
            FrameBuilder::command(RUN_CODE_TAG)
                .write_string(id)
                .write_string(code)
                .finish()
        });

        match (pending, registered) {
            (Ok(pending), Some((serial, output))) => {
                drop(executions);
                Ok(ExecutionStream::new(pending, output, serial, self.executions.clone()))
            }
            (Err(e), registered) => {
                if let Some((serial, _)) = registered {
                    executions.forget(serial);
                }
                Err(e)
            }
            (Ok(_), None) => unexpected("run code"),
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.core.pending_requests()
    }

    /// Number of executions that have not finished.
    pub fn open_executions(&self) -> usize {
        lock(&self.executions).open()
    }

    /// Whether a worker connection is live.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

/// Frame side of the kernel adapter.
pub struct KernelDispatcher {
    core: Arc<Core<KernelReply>>,
    executions: SharedExecutions,
}

impl KernelDispatcher {
    fn on_kernel_message(&self, channel: Channel, payload: String) {
        let msg: JupyterMessage = match JsonCodec::decode(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(?channel, error = %e, "failed to parse kernel message");
                self.core.emit(AdapterEvent::MessageParseError {
                    channel,
                    error: e.to_string(),
                    payload,
                });
                return;
            }
        };
        if !msg.is_valid() {
            return;
        }

        let msg_type = msg.msg_type().unwrap_or_default();
        if msg_type == "status" {
            if let Some(state) = msg.execution_state() {
                tracing::debug!(?channel, state, "kernel status");
                self.core.emit(AdapterEvent::KernelStatus(state.to_string()));
            }
        }

        let Some(msg_id) = msg.parent_msg_id() else {
            return;
        };
        let mut executions = lock(&self.executions);
        match channel {
            Channel::Shell => {
                if let Some(status) = shell_status(&msg) {
                    executions.on_shell_status(msg_id, status);
                }
            }
            Channel::IoPub => {
                if let Some(parsed) = parse_io_message(&msg) {
                    executions.on_output(msg_id, parsed);
                }
                if msg_type == "status" && msg.execution_state() == Some("idle") {
                    executions.on_idle(msg_id);
                }
            }
        }
    }
}

impl Dispatch for KernelDispatcher {
    fn dispatch(&mut self, tag: Tag, stream: &mut ByteStream) -> Result<Dispatched> {
        let Some(response) = Response::from_tag(tag) else {
            return Ok(Dispatched::UnknownTag);
        };

        match response {
            Response::Pong => {
                let Some([id, message]) = read_strings::<2>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.core.settle(&id, Ok(KernelReply::Pong(message)));
            }
            Response::SpecsListed => {
                let Some([id, json]) = read_strings::<2>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.core
                    .settle(&id, JsonCodec::decode(&json).map(KernelReply::KernelSpecs));
            }
            Response::KernelStarted => {
                let Some([id, uuid, config, connection_file]) = read_strings::<4>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                let reply = JsonCodec::decode(&config).map(|config| {
                    KernelReply::Started(StartedKernel {
                        uuid,
                        config,
                        connection_file,
                    })
                });
                self.core.settle(&id, reply);
            }
            Response::CommandCompleted => {
                let Some(id) = stream.read_string()? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.core.settle(&id, Ok(KernelReply::Completed));
            }
            Response::CodeAccepted => {
                let Some([id, msg_id]) = read_strings::<2>(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                lock(&self.executions).bind(&id, &msg_id);
                self.core.settle(&id, Ok(KernelReply::CodeAccepted(msg_id)));
            }
            Response::Message(channel) => {
                let Some(payload) = stream.read_string()? else {
                    return Ok(Dispatched::Incomplete);
                };
                self.on_kernel_message(channel, payload);
            }
            Response::Error => {
                let Some(error) = read_error_frame(stream)? else {
                    return Ok(Dispatched::Incomplete);
                };
                // The worker reports its own orderly exit this way.
                if error.command != "exit" {
                    self.core.on_error_frame(error);
                }
            }
        }
        Ok(Dispatched::Complete)
    }

    fn on_connected(&mut self, writer: WriterHandle) {
        self.core.on_connected(writer);
    }

    fn on_handshake(&mut self, handshake: &Handshake) {
        self.core.on_handshake(handshake);
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        lock(&self.executions).fail_all(|| SockwireError::ConnectionClosed);
        self.core.on_closed(reason);
    }
}
