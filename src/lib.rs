//! # sockwire
//!
//! Editor-side core of a length-prefixed socket protocol spoken with
//! out-of-process language workers (a completion server, a notebook
//! kernel server).
//!
//! ## Architecture
//!
//! - **Transport**: localhost TCP server on an ephemeral port; the worker
//!   is told the port on its command line and connects back
//! - **Protocol**: 4-byte command tags followed by typed fields, parsed
//!   with transactional reads so a partial frame is retried on more data
//! - **Engine**: handshake state machine, then tag dispatch
//! - **Adapters**: per-worker vocabularies with an id-keyed correlation
//!   table for concurrent requests
//! - **Supervisor**: spawns the worker and waits for readiness
//!
//! ## Example
//!
//! ```ignore
//! use sockwire::{JupyterClient, KernelSpecMetadata, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> sockwire::Result<()> {
//!     let mut jupyter = JupyterClient::new(WorkerConfig::new("python3", "ipython_server.py"));
//!     jupyter.start(&Default::default()).await?;
//!
//!     let spec = KernelSpecMetadata { name: "python3".into(), display_name: "Python 3".into(), language: None };
//!     jupyter.start_kernel(&spec).await?;
//!
//!     let mut output = jupyter.run_code("print('hello')")?;
//!     while let Some(item) = output.next().await {
//!         println!("{:?}", item?);
//!     }
//!     jupyter.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod supervisor;
pub mod transport;
pub mod writer;

mod client;
mod id_dispenser;

pub use adapter::completion::{CompletionClient, CompletionCommand};
pub use adapter::kernel::{ExecutionStream, KernelClient, KernelCommand, KernelSpecMetadata, ParsedIoMessage, StartedKernel};
pub use adapter::{AdapterEvent, AdapterEvents, CommandError};
pub use client::{CompletionServer, JupyterClient};
pub use error::{Result, SockwireError};
pub use id_dispenser::IdDispenser;
pub use supervisor::{ProcessSupervisor, WorkerConfig};
