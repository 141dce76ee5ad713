//! Per-execution output routing.
//!
//! An execution is known by its request id until the worker's `RUN `
//! reply names the kernel `msg_id` it was given. Output for a `msg_id`
//! that is not bound yet is buffered and replayed, in receipt order, when
//! the binding arrives. Unbound output is only kept while some execution
//! is still waiting for its `msg_id`; everything else is dropped. An
//! execution finishes once both the shell reply's status and the iopub
//! `idle` status have been seen; the status item is always the last one
//! delivered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::messages::ParsedIoMessage;
use super::KernelReply;
use crate::adapter::Pending;
use crate::error::{Result, SockwireError};

type OutputSender = mpsc::UnboundedSender<Result<ParsedIoMessage>>;
type OutputReceiver = mpsc::UnboundedReceiver<Result<ParsedIoMessage>>;

pub(crate) type SharedExecutions = Arc<Mutex<Executions>>;

pub(crate) fn lock(executions: &SharedExecutions) -> MutexGuard<'_, Executions> {
    executions.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Route {
    serial: u64,
    tx: OutputSender,
}

#[derive(Default)]
struct Final {
    status: Option<ParsedIoMessage>,
    idle: bool,
}

/// Routing state shared by the kernel client and dispatcher.
#[derive(Default)]
pub(crate) struct Executions {
    awaiting: HashMap<String, Route>,
    bound: HashMap<String, Route>,
    unhandled: HashMap<String, Vec<ParsedIoMessage>>,
    finals: HashMap<String, Final>,
    next_serial: u64,
}

impl Executions {
    /// Track a new execution under its request id.
    pub(crate) fn register(&mut self, request_id: &str) -> (u64, OutputReceiver) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.awaiting.insert(request_id.to_string(), Route { serial, tx });
        (serial, rx)
    }

    /// Bind the execution waiting on `request_id` to `msg_id`.
    pub(crate) fn bind(&mut self, request_id: &str, msg_id: &str) {
        let Some(route) = self.awaiting.remove(request_id) else {
            self.discard(msg_id);
            self.prune();
            return;
        };
        for parsed in self.unhandled.remove(msg_id).unwrap_or_default() {
            let _ = route.tx.send(Ok(parsed));
        }
        self.bound.insert(msg_id.to_string(), route);
        self.try_finish(msg_id);
        self.prune();
    }

    /// Whether anything for `msg_id` can still reach a stream.
    fn routable(&self, msg_id: &str) -> bool {
        self.bound.contains_key(msg_id) || !self.awaiting.is_empty()
    }

    /// Route one output item.
    pub(crate) fn on_output(&mut self, msg_id: &str, parsed: ParsedIoMessage) {
        if let Some(route) = self.bound.get(msg_id) {
            let _ = route.tx.send(Ok(parsed));
        } else if self.awaiting.is_empty() {
            tracing::trace!(msg_id, "dropping output for unknown execution");
        } else {
            self.unhandled.entry(msg_id.to_string()).or_default().push(parsed);
        }
    }

    /// The kernel went idle after handling `msg_id`.
    pub(crate) fn on_idle(&mut self, msg_id: &str) {
        if !self.routable(msg_id) {
            return;
        }
        self.finals.entry(msg_id.to_string()).or_default().idle = true;
        self.try_finish(msg_id);
    }

    /// The shell reply for `msg_id` arrived.
    pub(crate) fn on_shell_status(&mut self, msg_id: &str, status: ParsedIoMessage) {
        if !self.routable(msg_id) {
            return;
        }
        self.finals.entry(msg_id.to_string()).or_default().status = Some(status);
        self.try_finish(msg_id);
    }

    fn try_finish(&mut self, msg_id: &str) {
        let ready = self
            .finals
            .get(msg_id)
            .is_some_and(|f| f.idle && f.status.is_some());
        if !ready || !self.bound.contains_key(msg_id) {
            return;
        }
        let status = self.finals.remove(msg_id).and_then(|f| f.status);
        if let (Some(route), Some(status)) = (self.bound.remove(msg_id), status) {
            let _ = route.tx.send(Ok(status));
        }
    }

    /// Fail every open execution and drop buffered output.
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> SockwireError) -> usize {
        let routes: Vec<Route> = self
            .awaiting
            .drain()
            .chain(self.bound.drain())
            .map(|(_, route)| route)
            .collect();
        for route in &routes {
            let _ = route.tx.send(Err(error()));
        }
        self.unhandled.clear();
        self.finals.clear();
        routes.len()
    }

    /// Stop routing to the execution with `serial`.
    pub(crate) fn forget(&mut self, serial: u64) {
        self.awaiting.retain(|_, route| route.serial != serial);
        let stale: Vec<String> = self
            .bound
            .iter()
            .filter(|(_, route)| route.serial == serial)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();
        for msg_id in stale {
            self.bound.remove(&msg_id);
            self.discard(&msg_id);
        }
        self.prune();
    }

    fn discard(&mut self, msg_id: &str) {
        self.unhandled.remove(msg_id);
        self.finals.remove(msg_id);
    }

    /// With no execution waiting for its `msg_id`, unbound buffers can
    /// never be claimed.
    fn prune(&mut self) {
        if !self.awaiting.is_empty() {
            return;
        }
        self.unhandled.clear();
        let bound = &self.bound;
        self.finals.retain(|msg_id, _| bound.contains_key(msg_id));
    }

    /// Buffered output items and final statuses not yet delivered.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.unhandled.values().map(Vec::len).sum::<usize>() + self.finals.len()
    }

    /// Executions that have not finished.
    pub(crate) fn open(&self) -> usize {
        self.awaiting.len() + self.bound.len()
    }
}

/// Output of one `run_code` call.
///
/// Yields output items in the order the kernel produced them, then the
/// terminal status item, then `None`. A failure (worker error, restart,
/// shutdown, lost connection) is yielded once as `Err` and ends the stream.
///
/// Dropping the stream cancels the run request if it has not been
/// accepted yet and stops routing its output.
pub struct ExecutionStream {
    accepted: Option<Pending<KernelReply>>,
    output: OutputReceiver,
    msg_id: Option<String>,
    serial: u64,
    executions: SharedExecutions,
    done: bool,
}

impl ExecutionStream {
    pub(crate) fn new(
        accepted: Pending<KernelReply>,
        output: OutputReceiver,
        serial: u64,
        executions: SharedExecutions,
    ) -> Self {
        Self {
            accepted: Some(accepted),
            output,
            msg_id: None,
            serial,
            executions,
            done: false,
        }
    }

    /// Kernel message id, once the worker has accepted the code.
    pub fn msg_id(&self) -> Option<&str> {
        self.msg_id.as_deref()
    }

    /// Next output item.
    ///
    /// Cancel safe: dropping the returned future loses no item.
    pub async fn next(&mut self) -> Option<Result<ParsedIoMessage>> {
        if self.done {
            return None;
        }

        if let Some(accepted) = self.accepted.as_mut() {
            let reply = accepted.await;
            self.accepted = None;
            match reply {
                Ok(KernelReply::CodeAccepted(msg_id)) => {
                    tracing::debug!(%msg_id, "code accepted for execution");
                    self.msg_id = Some(msg_id);
                }
                Ok(_) => return self.fail(SockwireError::UnexpectedReply("run code")),
                Err(e) => return self.fail(e),
            }
        }

        match self.output.recv().await {
            Some(Err(e)) => self.fail(e),
            Some(item) => Some(item),
            None => {
                self.done = true;
                None
            }
        }
    }

    fn fail(&mut self, error: SockwireError) -> Option<Result<ParsedIoMessage>> {
        self.done = true;
        Some(Err(error))
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<ParsedIoMessage>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        lock(&self.executions).forget(self.serial);
    }
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("msg_id", &self.msg_id)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> ParsedIoMessage {
        let mut data = serde_json::Map::new();
        data.insert("text/plain".into(), s.into());
        ParsedIoMessage {
            data,
            mime_type: "text".into(),
            stream: "stdout".into(),
            message: None,
        }
    }

    fn drain(rx: &mut OutputReceiver) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            let item = item.unwrap();
            out.push(item.plain_text().unwrap_or_default().to_string());
        }
        out
    }

    #[test]
    fn test_output_before_bind_is_replayed_in_order() {
        let mut ex = Executions::default();
        let (_serial, mut rx) = ex.register("0");

        ex.on_output("m", text("a"));
        ex.on_output("m", text("b"));
        assert!(drain(&mut rx).is_empty());

        ex.bind("0", "m");
        ex.on_output("m", text("c"));
        assert_eq!(drain(&mut rx), ["a", "b", "c"]);
    }

    #[test]
    fn test_status_waits_for_idle() {
        let mut ex = Executions::default();
        let (_serial, mut rx) = ex.register("0");
        ex.bind("0", "m");

        ex.on_shell_status("m", ParsedIoMessage::status(true));
        ex.on_output("m", text("late output"));
        assert_eq!(drain(&mut rx), ["late output"]);
        assert_eq!(ex.open(), 1);

        ex.on_idle("m");
        assert_eq!(drain(&mut rx), ["ok"]);
        assert_eq!(ex.open(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_finals_before_bind() {
        let mut ex = Executions::default();
        let (_serial, mut rx) = ex.register("0");

        ex.on_output("m", text("x"));
        ex.on_idle("m");
        ex.on_shell_status("m", ParsedIoMessage::status(false));
        assert_eq!(ex.open(), 1);

        ex.bind("0", "m");
        assert_eq!(drain(&mut rx), ["x", "error"]);
        assert_eq!(ex.open(), 0);
    }

    #[test]
    fn test_fail_all() {
        let mut ex = Executions::default();
        let (_a, mut ra) = ex.register("0");
        let (_b, mut rb) = ex.register("1");
        ex.bind("1", "m");
        ex.on_output("other", text("buffered"));

        assert_eq!(ex.fail_all(|| SockwireError::KernelRestarted), 2);
        assert!(matches!(ra.try_recv(), Ok(Err(SockwireError::KernelRestarted))));
        assert!(matches!(rb.try_recv(), Ok(Err(SockwireError::KernelRestarted))));
        assert!(ex.unhandled.is_empty());
    }

    #[test]
    fn test_forget_matches_serial_only() {
        let mut ex = Executions::default();
        let (old, _rx) = ex.register("0");
        ex.forget(old);
        let (_new, _rx2) = ex.register("0");
        ex.forget(old);
        assert_eq!(ex.open(), 1);
    }

    #[test]
    fn test_dropped_execution_leaves_nothing_behind() {
        let mut ex = Executions::default();
        let (serial, _rx) = ex.register("0");
        ex.bind("0", "m0");
        ex.on_idle("m0");
        ex.forget(serial);
        assert_eq!(ex.buffered(), 0);

        for _ in 0..100 {
            ex.on_output("m0", text("late"));
        }
        ex.on_shell_status("m0", ParsedIoMessage::status(true));
        ex.on_idle("m0");
        ex.on_idle("foreign");
        assert!(ex.unhandled.is_empty());
        assert!(ex.finals.is_empty());
        assert_eq!(ex.open(), 0);
    }

    #[test]
    fn test_foreign_statuses_are_not_kept() {
        let mut ex = Executions::default();
        let (_serial, _rx) = ex.register("0");
        ex.bind("0", "m");

        ex.on_idle("kernel-info");
        ex.on_shell_status("complete", ParsedIoMessage::status(true));
        ex.on_output("elsewhere", text("x"));
        assert_eq!(ex.buffered(), 0);
        assert_eq!(ex.open(), 1);
    }

    #[test]
    fn test_unbound_buffers_released_when_last_execution_binds() {
        let mut ex = Executions::default();
        let (_a, _ra) = ex.register("0");
        let (_b, _rb) = ex.register("1");

        ex.on_output("stray", text("x"));
        ex.on_idle("stray");
        ex.bind("0", "m");
        assert_eq!(ex.buffered(), 2);

        ex.bind("1", "n");
        assert_eq!(ex.buffered(), 0);
        assert_eq!(ex.open(), 2);
    }

    #[test]
    fn test_late_acceptance_discards_its_buffer() {
        let mut ex = Executions::default();
        let (cancelled, _ra) = ex.register("0");
        let (_kept, _rb) = ex.register("1");

        ex.on_output("m0", text("x"));
        ex.on_idle("m0");
        ex.forget(cancelled);
        assert_eq!(ex.buffered(), 2);

        ex.bind("0", "m0");
        assert_eq!(ex.buffered(), 0);
        assert_eq!(ex.open(), 1);
    }
}
