//! RPC correlation.
//!
//! Each outbound ask takes a sequence number from a cyclic counter and
//! parks a waiter. Responses complete waiters by sequence; the periodic
//! tick sweeps the time-ordered list and fails anything older than the
//! configured deadline.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use parallax_core::CyclicSeq;
use parallax_proto::ErrorBody;

/// Why a waiter failed.
#[derive(Debug)]
pub(crate) enum RpcFailure {
    /// The ask exceeded its deadline.
    Timeout,
    /// The application error carried back in the response.
    App(ErrorBody),
}

type Waiter = oneshot::Sender<Result<Value, RpcFailure>>;

/// Correlation table for in-flight asks.
pub(crate) struct RpcTable {
    seq: CyclicSeq,
    waiters: DashMap<u64, Waiter>,
    deadlines: Mutex<VecDeque<(u64, Instant)>>,
}

impl RpcTable {
    pub(crate) fn new() -> Self {
        Self {
            seq: CyclicSeq::new(),
            waiters: DashMap::new(),
            deadlines: Mutex::new(VecDeque::new()),
        }
    }

    /// Allocates a sequence number and parks a waiter for it.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Result<Value, RpcFailure>>) {
        let seq = self.seq.next();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(seq, tx);
        self.deadlines.lock().push_back((seq, Instant::now()));
        (seq, rx)
    }

    /// Completes the waiter for `seq`; false when no waiter matches.
    pub(crate) fn complete(&self, seq: u64, result: Result<Value, RpcFailure>) -> bool {
        match self.waiters.remove(&seq) {
            Some((_, waiter)) => {
                let _ = waiter.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops the waiter for `seq` without completing it.
    pub(crate) fn abort(&self, seq: u64) {
        self.waiters.remove(&seq);
    }

    /// Fails every waiter older than `timeout`; returns how many.
    pub(crate) fn sweep(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut swept = 0;
        let mut deadlines = self.deadlines.lock();
        while let Some((seq, registered)) = deadlines.front().copied() {
            if now.duration_since(registered) < timeout {
                break;
            }
            deadlines.pop_front();
            if self.complete(seq, Err(RpcFailure::Timeout)) {
                swept += 1;
            }
        }
        swept
    }

    /// Drops every waiter (broker destroy).
    pub(crate) fn clear(&self) {
        self.waiters.clear();
        self.deadlines.lock().clear();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.waiters.len()
    }
}

impl std::fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTable")
            .field("in_flight", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_complete() {
        let table = RpcTable::new();
        let (seq, rx) = table.register();

        assert!(table.complete(seq, Ok(json!(42))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(42));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn unknown_sequence_is_ignored() {
        let table = RpcTable::new();
        assert!(!table.complete(999, Ok(json!(null))));
    }

    #[tokio::test]
    async fn sweep_fails_expired_waiters() {
        let table = RpcTable::new();
        let (_seq, rx) = table.register();

        // Nothing expires under a generous deadline.
        assert_eq!(table.sweep(Duration::from_secs(60)), 0);

        // Everything expires under a zero deadline.
        assert_eq!(table.sweep(Duration::ZERO), 1);
        assert!(matches!(rx.await.unwrap(), Err(RpcFailure::Timeout)));
        assert_eq!(table.pending(), 0);
    }

    #[tokio::test]
    async fn sweep_skips_already_completed() {
        let table = RpcTable::new();
        let (seq, _rx) = table.register();
        table.complete(seq, Ok(json!(null)));

        assert_eq!(table.sweep(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn aborted_waiter_errors_on_receive() {
        let table = RpcTable::new();
        let (seq, rx) = table.register();
        table.abort(seq);
        assert!(rx.await.is_err());
    }
}
