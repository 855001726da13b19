//! Outstanding call tracking.
//!
//! Every in-flight REQUEST owns one entry in a [`PendingCalls`] table keyed by
//! correlation id. Four producers race to remove an entry: the reader task
//! (matching RESPONSE), the entry's timeout task, the writer task (send
//! failure) and connection shutdown. Each of them removes through a single
//! atomic map operation, so exactly one of them resolves the caller's handle.
//!
//! Registrations carry a generation number. Timeout and send-failure removal
//! only succeed if the generation still matches, which keeps the timer of a
//! superseded call from removing the call that replaced it.

use crate::error::ClientError;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Deadline used when `registered_at + timeout` overflows (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome delivered to a caller.
pub type CallResult = Result<Bytes, ClientError>;

struct PendingCall {
    generation: u64,
    tx: oneshot::Sender<CallResult>,
    registered_at: Instant,
    timeout: Duration,
    timer: Option<AbortHandle>,
}

impl PendingCall {
    fn resolve(self, result: CallResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have dropped its handle; nothing to deliver then
        let _ = self.tx.send(result);
    }
}

/// Identifies one registration in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallKey {
    pub correlation_id: u64,
    pub generation: u64,
}

/// Table of calls awaiting a RESPONSE on one connection.
pub struct PendingCalls {
    calls: DashMap<u64, PendingCall>,
    next_generation: AtomicU64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Installs a pending call and arms its timeout.
    ///
    /// If a call is already pending under `correlation_id` it is resolved with
    /// [`ClientError::Superseded`] before this one takes its place. Must be
    /// called from within a Tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: u64,
        timeout: Duration,
    ) -> (CallKey, CallHandle) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = CallKey {
            correlation_id,
            generation,
        };
        let registered_at = Instant::now();
        let deadline = registered_at
            .checked_add(timeout)
            .unwrap_or_else(|| registered_at + FAR_FUTURE);

        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            generation,
            tx,
            registered_at,
            timeout,
            timer: None,
        };

        if let Some(previous) = self.calls.insert(correlation_id, call) {
            tracing::warn!(
                correlation_id,
                "Duplicate correlation id, superseding the earlier call"
            );
            previous.resolve(Err(ClientError::Superseded(correlation_id)));
        }

        // Armed after insertion so an already-elapsed deadline still finds the entry
        let timer = {
            let table = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                table.expire(key);
            })
        };
        match self.calls.get_mut(&correlation_id) {
            Some(mut call) if call.generation == generation => {
                call.timer = Some(timer.abort_handle());
            }
            _ => timer.abort(),
        }

        (key, CallHandle::new(correlation_id, rx))
    }

    /// Resolves the call waiting on `correlation_id` with a response payload.
    ///
    /// Returns false if no call is pending under that id (it already timed
    /// out, failed, or was never issued); the response is dropped.
    pub fn complete(&self, correlation_id: u64, payload: Bytes) -> bool {
        match self.calls.remove(&correlation_id) {
            Some((_, call)) => {
                tracing::debug!(
                    correlation_id,
                    elapsed_ms = call.registered_at.elapsed().as_millis() as u64,
                    "Call completed"
                );
                call.resolve(Ok(payload));
                true
            }
            None => {
                tracing::debug!(correlation_id, "Dropping unmatched response");
                false
            }
        }
    }

    /// Resolves one specific registration with `error`.
    ///
    /// Does nothing if that registration is no longer pending.
    pub fn fail(&self, key: CallKey, error: ClientError) -> bool {
        match self.remove_registration(key) {
            Some(call) => {
                call.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Timeout path: resolves the registration if it is still pending.
    fn expire(&self, key: CallKey) {
        if let Some(mut call) = self.remove_registration(key) {
            tracing::debug!(
                correlation_id = key.correlation_id,
                timeout_ms = call.timeout.as_millis() as u64,
                "Call timed out"
            );
            // Running inside the timer task itself; leave it to finish
            call.timer = None;
            let after = call.timeout;
            call.resolve(Err(ClientError::Timeout {
                correlation_id: key.correlation_id,
                after,
            }));
        }
    }

    fn remove_registration(&self, key: CallKey) -> Option<PendingCall> {
        self.calls
            .remove_if(&key.correlation_id, |_, call| {
                call.generation == key.generation
            })
            .map(|(_, call)| call)
    }

    /// Resolves every pending call with the error produced by `error`.
    ///
    /// Returns the number of calls failed.
    pub fn fail_all(&self, error: impl Fn() -> ClientError) -> usize {
        let ids: Vec<u64> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                call.resolve(Err(error()));
                failed += 1;
            }
        }
        failed
    }

    /// Returns whether `correlation_id` has a pending call.
    pub fn contains(&self, correlation_id: u64) -> bool {
        self.calls.contains_key(&correlation_id)
    }

    /// Returns the number of pending calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-resolution result of a call.
///
/// Await it, or poll it without blocking through [`CallHandle::try_result`].
/// It resolves exactly once, with the response payload or the error that
/// ended the call first.
#[derive(Debug)]
pub struct CallHandle {
    correlation_id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl CallHandle {
    fn new(correlation_id: u64, rx: oneshot::Receiver<CallResult>) -> Self {
        Self { correlation_id, rx }
    }

    /// Creates a handle that is already resolved.
    pub(crate) fn ready(correlation_id: u64, result: CallResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(correlation_id, rx)
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Returns the outcome if the call has resolved, without waiting.
    ///
    /// The outcome is handed out once; later calls report the handle as
    /// closed.
    pub fn try_result(&mut self) -> Option<CallResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::ConnectionClosed)),
        }
    }
}

impl Future for CallHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::ConnectionClosed)))
    }
}
