//! Outbound connection lifecycle.
//!
//! Each outbound connection runs one writer task owning the socket's write
//! half and one reader task owning the read half. Requests issued while
//! the connection is `opening` queue on the writer's channel and flush in
//! arrival order once the connect completes. The queue is unbounded, as
//! in the original design; bounding it remains an acknowledged risk.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use parallax_proto::FrameDecoder;

use crate::error::RouterError;
use crate::router::RouterEvent;

/// Outbound connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Connect in flight; requests queue.
    Opening = 0,
    /// Connected; requests write through.
    Open = 1,
    /// Idle timeout hit; about to close.
    Closing = 2,
    /// Gone; a new request replaces the connection.
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One queued request: a complete frame plus a completion ack.
pub(crate) struct SendJob {
    pub frame: Vec<u8>,
    pub ack: oneshot::Sender<Result<(), RouterError>>,
}

/// Handle to an outbound connection held in the router's table.
#[derive(Clone)]
pub(crate) struct OutboundHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<SendJob>,
    pub state: Arc<AtomicU8>,
}

impl OutboundHandle {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

pub(crate) struct OutboundTaskContext {
    pub addr: String,
    pub conn_id: u64,
    pub soc_timeout: Duration,
    pub events: mpsc::Sender<RouterEvent>,
    pub table: Arc<DashMap<String, OutboundHandle>>,
    pub cancel: CancellationToken,
}

/// Runs the writer side of one outbound connection to completion.
pub(crate) async fn run_outbound(
    ctx: OutboundTaskContext,
    mut rx: mpsc::UnboundedReceiver<SendJob>,
    state: Arc<AtomicU8>,
) {
    let stream = match TcpStream::connect(&ctx.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(addr = %ctx.addr, error = %e, "peer connect failed");
            state.store(ConnectionState::Closed as u8, Ordering::Release);
            remove_handle(&ctx);
            let reason = e.to_string();
            reject_pending(&mut rx, || RouterError::Connect {
                addr: ctx.addr.clone(),
                reason: reason.clone(),
            });
            return;
        }
    };

    state.store(ConnectionState::Open as u8, Ordering::Release);
    tracing::debug!(addr = %ctx.addr, "peer connection open");

    let (read_half, mut write_half) = stream.into_split();
    let reader_cancel = ctx.cancel.child_token();
    tokio::spawn(run_outbound_reader(
        read_half,
        ctx.addr.clone(),
        ctx.conn_id,
        ctx.events.clone(),
        Arc::clone(&ctx.table),
        Arc::clone(&state),
        reader_cancel.clone(),
    ));

    loop {
        let job = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            job = tokio::time::timeout(ctx.soc_timeout, rx.recv()) => match job {
                // Idle for a full socket timeout: close.
                Err(_) => {
                    state.store(ConnectionState::Closing as u8, Ordering::Release);
                    tracing::debug!(addr = %ctx.addr, "peer connection idle, closing");
                    break;
                }
                Ok(None) => break,
                Ok(Some(job)) => job,
            },
        };

        match write_half.write_all(&job.frame).await {
            Ok(()) => {
                let _ = job.ack.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!(addr = %ctx.addr, error = %e, "peer write failed");
                let reason = e.to_string();
                let _ = job.ack.send(Err(RouterError::Io(e)));
                state.store(ConnectionState::Closed as u8, Ordering::Release);
                remove_handle(&ctx);
                reject_pending(&mut rx, || RouterError::Write {
                    addr: ctx.addr.clone(),
                    reason: reason.clone(),
                });
                reader_cancel.cancel();
                return;
            }
        }
    }

    state.store(ConnectionState::Closed as u8, Ordering::Release);
    remove_handle(&ctx);
    discard_pending(&mut rx, &ctx.addr);
    reader_cancel.cancel();
    let _ = write_half.shutdown().await;
}

/// Reads responses off an outbound connection.
async fn run_outbound_reader(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    addr: String,
    conn_id: u64,
    events: mpsc::Sender<RouterEvent>,
    table: Arc<DashMap<String, OutboundHandle>>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    let disconnect_reason = loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return,
            read = read_half.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break "peer closed",
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            if message.is_response() {
                                if events.send(RouterEvent::Response { message }).await.is_err() {
                                    return;
                                }
                            } else {
                                tracing::debug!(addr = %addr, "non-response frame on client connection ignored");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Fatal: tear the connection down.
                            tracing::warn!(addr = %addr, error = %e, "peer frame decode failed");
                            end_outbound(&addr, conn_id, &table, &state, &events).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "peer read failed");
                break "read error";
            }
        }
    };

    tracing::debug!(addr = %addr, reason = disconnect_reason, "peer connection lost");
    end_outbound(&addr, conn_id, &table, &state, &events).await;
}

async fn end_outbound(
    addr: &str,
    conn_id: u64,
    table: &DashMap<String, OutboundHandle>,
    state: &AtomicU8,
    events: &mpsc::Sender<RouterEvent>,
) {
    state.store(ConnectionState::Closed as u8, Ordering::Release);
    table.remove_if(addr, |_, handle| handle.id == conn_id);
    let _ = events
        .send(RouterEvent::Disconnect {
            addr: addr.to_owned(),
        })
        .await;
}

fn remove_handle(ctx: &OutboundTaskContext) {
    ctx.table
        .remove_if(&ctx.addr, |_, handle| handle.id == ctx.conn_id);
}

/// Error close: every queued request is rejected with the last socket
/// error, built by `error` so connect and write failures keep their kind.
fn reject_pending(rx: &mut mpsc::UnboundedReceiver<SendJob>, error: impl Fn() -> RouterError) {
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.ack.send(Err(error()));
    }
}

/// Clean close: pending items at this point are an anomaly.
fn discard_pending(rx: &mut mpsc::UnboundedReceiver<SendJob>, addr: &str) {
    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(addr = %addr, discarded, "requests discarded on clean close");
    }
}
