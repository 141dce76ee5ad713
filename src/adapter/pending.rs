//! Request/response correlation.
//!
//! Every outstanding request owns an entry keyed by a decimal id string
//! from an [`IdDispenser`]. An entry is removed, and its id freed, exactly
//! once: on the matching response, on a worker error naming it, on local
//! cancellation, or when the connection goes away.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SockwireError};
use crate::id_dispenser::IdDispenser;

/// Identity of one request.
///
/// Ids are reused once freed, so a ticket also carries the sequence number
/// of the registration it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    id: String,
    seq: u64,
}

impl Ticket {
    /// The wire id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct Entry<R> {
    seq: u64,
    numeric: u32,
    tx: oneshot::Sender<Result<R>>,
}

/// Map from request id to the sender that settles it.
pub struct CorrelationTable<R> {
    ids: IdDispenser,
    entries: HashMap<String, Entry<R>>,
    next_seq: u64,
}

impl<R> CorrelationTable<R> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            ids: IdDispenser::new(),
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Register a new request.
    pub fn open(&mut self) -> (Ticket, oneshot::Receiver<Result<R>>) {
        let numeric = self.ids.allocate();
        let id = numeric.to_string();
        let seq = self.next_seq;
        self.next_seq += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.clone(), Entry { seq, numeric, tx });
        (Ticket { id, seq }, rx)
    }

    fn remove(&mut self, id: &str) -> Option<Entry<R>> {
        let entry = self.entries.remove(id)?;
        self.ids.free(entry.numeric);
        Some(entry)
    }

    /// Settle the request with `id`.
    ///
    /// Returns `false` when no such request is outstanding (already settled
    /// or cancelled); the result is dropped.
    pub fn settle(&mut self, id: &str, result: Result<R>) -> bool {
        match self.remove(id) {
            Some(entry) => {
                // The receiver may have been dropped in the meantime.
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve the request with `id`.
    pub fn resolve(&mut self, id: &str, value: R) -> bool {
        self.settle(id, Ok(value))
    }

    /// Reject the request with `id`.
    pub fn reject(&mut self, id: &str, error: SockwireError) -> bool {
        self.settle(id, Err(error))
    }

    /// Remove the request a ticket names, without settling it.
    ///
    /// A ticket whose id now belongs to a newer request is ignored.
    pub fn cancel(&mut self, ticket: &Ticket) -> bool {
        match self.entries.get(&ticket.id) {
            Some(entry) if entry.seq == ticket.seq => self.remove(&ticket.id).is_some(),
            _ => false,
        }
    }

    /// Reject every outstanding request.
    pub fn reject_all(&mut self, error: impl Fn() -> SockwireError) -> usize {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in &ids {
            self.reject(id, error());
        }
        ids.len()
    }

    /// Reject every outstanding request except `keep`.
    pub fn reject_all_except(&mut self, keep: &str, error: impl Fn() -> SockwireError) -> usize {
        let ids: Vec<String> = self
            .entries
            .keys()
            .filter(|id| id.as_str() != keep)
            .cloned()
            .collect();
        for id in &ids {
            self.reject(id, error());
        }
        ids.len()
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<R> Default for CorrelationTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a request from whatever table owns it.
pub(crate) trait CancelRequest: Send + Sync {
    fn cancel(&self, ticket: &Ticket);
}

/// Future for one request's reply.
///
/// Dropping it before it completes cancels the request locally: the entry
/// is removed and the id freed, and a late response is discarded. No frame
/// is sent to the worker.
#[must_use = "dropping a Pending cancels the request"]
pub struct Pending<R> {
    ticket: Ticket,
    rx: oneshot::Receiver<Result<R>>,
    owner: Arc<dyn CancelRequest>,
    settled: bool,
}

impl<R> Pending<R> {
    pub(crate) fn new(
        ticket: Ticket,
        rx: oneshot::Receiver<Result<R>>,
        owner: Arc<dyn CancelRequest>,
    ) -> Self {
        Self {
            ticket,
            rx,
            owner,
            settled: false,
        }
    }

    /// The request id.
    pub fn id(&self) -> &str {
        self.ticket.id()
    }

    /// Await the reply unless `token` fires first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires; the request is removed.
    pub async fn cancellable(mut self, token: CancellationToken) -> Result<R> {
        tokio::select! {
            result = &mut self => result,
            () = token.cancelled() => Err(SockwireError::Cancelled),
        }
    }
}

impl<R> Future for Pending<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.settled = true;
                Poll::Ready(result.unwrap_or(Err(SockwireError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> Drop for Pending<R> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(id = %self.ticket.id, "request dropped before reply, cancelling");
            self.owner.cancel(&self.ticket);
        }
    }
}

impl<R> std::fmt::Debug for Pending<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.ticket.id)
            .field("settled", &self.settled)
            .finish()
    }
}
