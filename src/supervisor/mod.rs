//! Worker process supervision.
//!
//! The supervisor owns one socket server and one worker process at a time:
//!
//! 1. Bind the socket server on an ephemeral localhost port
//! 2. Start a session that drives the adapter's dispatcher
//! 3. Spawn `interpreter script <port> args...`
//! 4. Wait until the worker printed its ready line AND completed the
//!    protocol handshake
//!
//! Worker stdout is logged at `info`, stderr at `warn`, both under the
//! `sockwire::worker` target.

mod config;

pub use config::{WorkerConfig, DEFAULT_READY_LINE};

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, SockwireError};
use crate::handler::{spawn_session, Dispatch, Handshake};
use crate::transport::SocketServer;

/// Time the session gets to observe the close before it is aborted.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct Running {
    child: Child,
    stdin: Option<ChildStdin>,
    server: SocketServer,
    session: JoinHandle<()>,
    output: [JoinHandle<()>; 2],
    handshake: Handshake,
}

/// Spawns a worker and tracks it until disposal.
pub struct ProcessSupervisor {
    config: WorkerConfig,
    running: Option<Running>,
}

impl ProcessSupervisor {
    /// A supervisor for `config`; nothing runs until [`start`](Self::start).
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    /// Launch configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether a worker is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Port of the running worker's socket server.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.server.port())
    }

    /// Handshake of the running worker.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.running.as_ref().map(|r| &r.handshake)
    }

    /// Launch the worker and wait until it is ready.
    ///
    /// `dispatcher` receives every frame the worker sends. `env` is added
    /// to the worker's environment for keys the current process does not
    /// define.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if a worker is running
    /// - `Bind` if no port could be bound
    /// - `Spawn` if the process could not be created
    /// - `WorkerExited` if it exits before becoming ready
    /// - `StartupTimeout` if the configured bound elapses
    pub async fn start<D: Dispatch>(&mut self, dispatcher: D, env: &HashMap<String, String>) -> Result<u16> {
        if self.running.is_some() {
            return Err(SockwireError::AlreadyStarted);
        }

        let (server, events) = SocketServer::start().await?;
        let port = server.port();
        let (session, handshake_rx) =
            spawn_session(server.handle(), events, dispatcher, self.config.max_string_length);

        let mut child = match self.spawn_child(port, env) {
            Ok(child) => child,
            Err(e) => {
                server.stop();
                session.abort();
                return Err(e);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(log_stdout(out, self.config.ready_line.clone(), ready_tx)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(log_stderr(err)));
        let stdin = child.stdin.take();
        let output = [stdout, stderr].map(|task| task.unwrap_or_else(|| tokio::spawn(async {})));

        let startup = wait_ready(&mut child, ready_rx, handshake_rx);
        let ready = match self.config.startup_timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, startup)
                .await
                .unwrap_or(Err(SockwireError::StartupTimeout(limit))),
            None => startup.await,
        };

        match ready {
            Ok(handshake) => {
                tracing::info!(port, pid = handshake.pid, guid = %handshake.guid, "worker ready");
                self.running = Some(Running {
                    child,
                    stdin,
                    server,
                    session,
                    output,
                    handshake,
                });
                Ok(port)
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "worker failed to start");
                if let Err(kill) = child.kill().await {
                    tracing::debug!(error = %kill, "worker already gone");
                }
                server.stop();
                session.abort();
                for task in &output {
                    task.abort();
                }
                Err(e)
            }
        }
    }

    fn spawn_child(&self, port: u16, env: &HashMap<String, String>) -> Result<Child> {
        let config = &self.config;
        let mut command = Command::new(&config.interpreter);
        command
            .arg(&config.script)
            .arg(port.to_string())
            .args(&config.args)
            .envs(config.env_additions(env, |key| std::env::var_os(key).is_some()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        tracing::debug!(interpreter = %config.interpreter.display(), script = %config.script.display(), port, "spawning worker");
        command.spawn().map_err(|source| SockwireError::Spawn {
            program: config.interpreter.display().to_string(),
            source,
        })
    }

    /// Stop the worker.
    ///
    /// `farewell`, if given, is written to the worker's stdin as one line
    /// first. The process is then killed, the server stopped, and the
    /// session given a moment to close the adapter. Idempotent.
    pub async fn dispose(&mut self, farewell: Option<&str>) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        if let (Some(stdin), Some(line)) = (running.stdin.as_mut(), farewell) {
            let mut message = line.as_bytes().to_vec();
            message.push(b'\n');
            if let Err(e) = stdin.write_all(&message).await {
                tracing::debug!(error = %e, "worker stdin closed before farewell");
            }
        }
        drop(running.stdin.take());

        if let Err(e) = running.child.kill().await {
            tracing::debug!(error = %e, "worker already gone");
        }
        running.server.stop();

        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, &mut running.session)
            .await
            .is_err()
        {
            running.session.abort();
        }
        for task in &running.output {
            task.abort();
        }
        tracing::info!(port = running.server.port(), "worker disposed");
    }
}

async fn wait_ready(
    child: &mut Child,
    ready_rx: oneshot::Receiver<()>,
    handshake_rx: oneshot::Receiver<Handshake>,
) -> Result<Handshake> {
    let both = async {
        tokio::try_join!(
            async { ready_rx.await.map_err(|_| SockwireError::WorkerExited) },
            async { handshake_rx.await.map_err(|_| SockwireError::WorkerExited) },
        )
        .map(|((), handshake)| handshake)
    };

    tokio::select! {
        ready = both => ready,
        status = child.wait() => {
            match status {
                Ok(status) => tracing::warn!(%status, "worker exited during startup"),
                Err(e) => tracing::warn!(error = %e, "failed to wait on worker"),
            }
            Err(SockwireError::WorkerExited)
        }
    }
}

async fn log_stdout(out: impl AsyncRead + Unpin, ready_line: String, ready_tx: oneshot::Sender<()>) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(out).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if ready_tx.is_some() && line == ready_line {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                    continue;
                }
                tracing::info!(target: "sockwire::worker", "{line}");
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "sockwire::worker", error = %e, "worker stdout unreadable");
                break;
            }
        }
    }
}

async fn log_stderr(err: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(err).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "sockwire::worker", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn script(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn sh(script: &NamedTempFile) -> WorkerConfig {
        WorkerConfig::new("sh", script.path()).startup_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut supervisor = ProcessSupervisor::new(WorkerConfig::new("/nonexistent/interpreter-4242", "x"));
        let err = supervisor
            .start(HandlerRegistry::new(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SockwireError::Spawn { .. }));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let file = script("echo booting\nexit 3\n");
        let mut supervisor = ProcessSupervisor::new(sh(&file));
        let err = supervisor
            .start(HandlerRegistry::new(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SockwireError::WorkerExited));
    }

    #[tokio::test]
    async fn test_ready_line_without_handshake_times_out() {
        let file = script("echo Started\nsleep 30\n");
        let config = sh(&file).startup_timeout(Duration::from_millis(300));
        let mut supervisor = ProcessSupervisor::new(config);
        let err = supervisor
            .start(HandlerRegistry::new(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SockwireError::StartupTimeout(_)));
        assert!(supervisor.port().is_none());
    }

    #[tokio::test]
    async fn test_dispose_without_start_is_noop() {
        let mut supervisor = ProcessSupervisor::new(WorkerConfig::default());
        supervisor.dispose(Some("bye")).await;
        supervisor.dispose(None).await;
        assert!(!supervisor.is_running());
    }
}
