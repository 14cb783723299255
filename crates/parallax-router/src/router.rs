//! The router: listener, outbound table, event demultiplexing.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use parallax_core::CyclicSeq;
use parallax_proto::{encode_frame, FrameDecoder, PeerMessage};

use crate::connection::{
    run_outbound, ConnectionState, OutboundHandle, OutboundTaskContext, SendJob,
};
use crate::error::{Result, RouterError};

/// Router configuration.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Outbound idle timeout; the server side uses twice this value so the
    /// two ends never race to close simultaneously.
    pub soc_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            soc_timeout: Duration::from_secs(60),
        }
    }
}

/// Events surfaced to the router's owner.
#[derive(Debug)]
pub enum RouterEvent {
    /// A request arrived on an inbound connection.
    Request {
        message: PeerMessage,
        requester_id: u64,
    },
    /// A response arrived on an outbound connection.
    Response { message: PeerMessage },
    /// A connection was lost.
    Disconnect { addr: String },
}

struct Inbound {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

struct Shared {
    config: RouterConfig,
    events: mpsc::Sender<RouterEvent>,
    outbound: Arc<DashMap<String, OutboundHandle>>,
    inbound: DashMap<u64, Inbound>,
    requester_seq: CyclicSeq,
    conn_seq: CyclicSeq,
    cancel: CancellationToken,
}

/// Peer message router.
///
/// One instance per broker. All sockets are owned here; the broker sees
/// only [`RouterEvent`]s and the `request`/`respond` calls.
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    /// Creates a router and the event stream its owner drains.
    #[must_use]
    pub fn new(config: RouterConfig) -> (Self, mpsc::Receiver<RouterEvent>) {
        let (events, receiver) = mpsc::channel(1024);
        let shared = Arc::new(Shared {
            config,
            events,
            outbound: Arc::new(DashMap::new()),
            inbound: DashMap::new(),
            requester_seq: CyclicSeq::new(),
            conn_seq: CyclicSeq::new(),
            cancel: CancellationToken::new(),
        });
        (Self { shared }, receiver)
    }

    /// Opens the inbound listener on an OS-assigned port.
    ///
    /// Returns the effective bound address; the caller must treat a bound
    /// host that differs from the requested one as a failure.
    pub async fn listen(&self, host: IpAddr) -> Result<SocketAddr> {
        if self.shared.cancel.is_cancelled() {
            return Err(RouterError::Closed);
        }

        let listener = TcpListener::bind((host, 0)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "router listening");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = shared.cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        accept_inbound(&shared, stream, peer);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Sends a message to a peer, opening a connection if necessary.
    ///
    /// Resolves once the frame is written to the socket, not when the
    /// peer reads it. Requests issued while the connection is opening
    /// queue and flush in order.
    pub async fn request(&self, addr: &str, message: &PeerMessage) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(RouterError::Closed);
        }
        let frame = encode_frame(message)?;

        // A closing or closed connection is discarded and redialled; a
        // few attempts bound the redial loop under churn.
        for _ in 0..3 {
            let handle = self.obtain_outbound(addr);
            if matches!(
                handle.state(),
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                self.shared
                    .outbound
                    .remove_if(addr, |_, h| h.id == handle.id);
                continue;
            }

            let (ack_tx, ack_rx) = oneshot::channel();
            if handle
                .tx
                .send(SendJob {
                    frame: frame.clone(),
                    ack: ack_tx,
                })
                .is_err()
            {
                self.shared
                    .outbound
                    .remove_if(addr, |_, h| h.id == handle.id);
                continue;
            }

            return match ack_rx.await {
                Ok(result) => result,
                Err(_) => Err(RouterError::Dropped {
                    addr: addr.to_owned(),
                }),
            };
        }

        Err(RouterError::Dropped {
            addr: addr.to_owned(),
        })
    }

    /// Writes a response on the inbound connection that carried the
    /// original request. A vanished requester is dropped with a log.
    pub async fn respond(&self, requester_id: u64, message: &PeerMessage) -> Result<()> {
        let frame = encode_frame(message)?;

        let Some(writer) = self
            .shared
            .inbound
            .get(&requester_id)
            .map(|entry| Arc::clone(&entry.writer))
        else {
            tracing::warn!(requester_id, "response dropped: requester connection gone");
            return Ok(());
        };

        let mut writer = writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!(requester_id, error = %e, "response write failed");
            self.shared.inbound.remove(&requester_id);
        }
        Ok(())
    }

    /// Destroys every connection and stops accepting.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.outbound.clear();
        self.shared.inbound.clear();
        tracing::debug!("router closed");
    }

    fn obtain_outbound(&self, addr: &str) -> OutboundHandle {
        self.shared
            .outbound
            .entry(addr.to_owned())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let state = Arc::new(AtomicU8::new(ConnectionState::Opening as u8));
                let handle = OutboundHandle {
                    id: self.shared.conn_seq.next(),
                    tx,
                    state: Arc::clone(&state),
                };
                let ctx = OutboundTaskContext {
                    addr: addr.to_owned(),
                    conn_id: handle.id,
                    soc_timeout: self.shared.config.soc_timeout,
                    events: self.shared.events.clone(),
                    table: Arc::clone(&self.shared.outbound),
                    cancel: self.shared.cancel.clone(),
                };
                tokio::spawn(run_outbound(ctx, rx, state));
                handle
            })
            .clone()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("outbound", &self.shared.outbound.len())
            .field("inbound", &self.shared.inbound.len())
            .finish_non_exhaustive()
    }
}

fn accept_inbound(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let requester_id = shared.requester_seq.next();
    let (read_half, write_half) = stream.into_split();

    shared.inbound.insert(
        requester_id,
        Inbound {
            writer: Arc::new(Mutex::new(write_half)),
        },
    );
    tracing::debug!(requester_id, peer = %peer, "inbound connection accepted");

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        run_inbound_reader(&shared, requester_id, read_half, peer).await;
    });
}

async fn run_inbound_reader(
    shared: &Arc<Shared>,
    requester_id: u64,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    peer: SocketAddr,
) {
    // Twice the client-side timeout, so the idle client closes first.
    let idle = shared.config.soc_timeout * 2;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    loop {
        let read = tokio::select! {
            () = shared.cancel.cancelled() => return,
            read = tokio::time::timeout(idle, read_half.read(&mut buf)) => match read {
                Err(_) => {
                    tracing::debug!(requester_id, peer = %peer, "inbound connection idle, closing");
                    break;
                }
                Ok(read) => read,
            },
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            let event = RouterEvent::Request {
                                message,
                                requester_id,
                            };
                            if shared.events.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(requester_id, peer = %peer, error = %e, "inbound frame decode failed");
                            end_inbound(shared, requester_id, peer).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(requester_id, peer = %peer, error = %e, "inbound read failed");
                break;
            }
        }
    }

    end_inbound(shared, requester_id, peer).await;
}

async fn end_inbound(shared: &Arc<Shared>, requester_id: u64, peer: SocketAddr) {
    shared.inbound.remove(&requester_id);
    let _ = shared
        .events
        .send(RouterEvent::Disconnect {
            addr: peer.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn next_event(rx: &mut mpsc::Receiver<RouterEvent>) -> RouterEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no router event within 2s")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn listen_reports_bound_address() {
        let (router, _events) = Router::new(RouterConfig::default());
        let addr = router.listen(localhost()).await.unwrap();
        assert_eq!(addr.ip(), localhost());
        assert_ne!(addr.port(), 0);
        router.close();
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let (server, mut server_events) = Router::new(RouterConfig::default());
        let server_addr = server.listen(localhost()).await.unwrap();

        let (client, mut client_events) = Router::new(RouterConfig::default());
        let request = PeerMessage::request("greet", 5, Some("w1".into()), json!({"hello": true}));
        client
            .request(&server_addr.to_string(), &request)
            .await
            .unwrap();

        let RouterEvent::Request {
            message,
            requester_id,
        } = next_event(&mut server_events).await
        else {
            panic!("expected a request event");
        };
        assert_eq!(message, request);

        let response = PeerMessage::response_ok(5, json!("hi"));
        server.respond(requester_id, &response).await.unwrap();

        let RouterEvent::Response { message } = next_event(&mut client_events).await else {
            panic!("expected a response event");
        };
        assert_eq!(message, response);

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn queued_requests_flush_in_order() {
        let (server, mut server_events) = Router::new(RouterConfig::default());
        let server_addr = server.listen(localhost()).await.unwrap();
        let addr = server_addr.to_string();

        let (client, _client_events) = Router::new(RouterConfig::default());

        // Issue several requests back to back; the first ones queue while
        // the connection is still opening.
        for i in 0..5_u64 {
            let message = PeerMessage::tell("step", None, json!(i));
            client.request(&addr, &message).await.unwrap();
        }

        for expected in 0..5_u64 {
            let RouterEvent::Request { message, .. } = next_event(&mut server_events).await else {
                panic!("expected a request event");
            };
            assert_eq!(message.pl, json!(expected));
        }

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn connection_reuse_keeps_one_requester_id() {
        let (server, mut server_events) = Router::new(RouterConfig::default());
        let server_addr = server.listen(localhost()).await.unwrap();
        let addr = server_addr.to_string();

        let (client, _client_events) = Router::new(RouterConfig::default());
        for _ in 0..2 {
            client
                .request(&addr, &PeerMessage::tell("t", None, json!(null)))
                .await
                .unwrap();
        }

        let first = match next_event(&mut server_events).await {
            RouterEvent::Request { requester_id, .. } => requester_id,
            other => panic!("unexpected event: {other:?}"),
        };
        let second = match next_event(&mut server_events).await {
            RouterEvent::Request { requester_id, .. } => requester_id,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(first, second);

        client.close();
        server.close();
    }

    #[tokio::test]
    async fn request_to_dead_peer_fails() {
        let (client, _events) = Router::new(RouterConfig::default());

        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind((localhost(), 0)).await.unwrap();
        let dead_addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = client
            .request(&dead_addr, &PeerMessage::tell("t", None, json!(null)))
            .await;
        assert!(matches!(
            result,
            Err(RouterError::Connect { .. } | RouterError::Dropped { .. })
        ));
        client.close();
    }

    #[tokio::test]
    async fn closed_router_rejects_requests() {
        let (client, _events) = Router::new(RouterConfig::default());
        client.close();

        let result = client
            .request("127.0.0.1:1", &PeerMessage::tell("t", None, json!(null)))
            .await;
        assert!(matches!(result, Err(RouterError::Closed)));
    }

    #[tokio::test]
    async fn peer_close_emits_disconnect() {
        let (server, mut server_events) = Router::new(RouterConfig::default());
        let server_addr = server.listen(localhost()).await.unwrap();

        let (client, _client_events) = Router::new(RouterConfig::default());
        client
            .request(
                &server_addr.to_string(),
                &PeerMessage::tell("t", None, json!(null)),
            )
            .await
            .unwrap();

        let RouterEvent::Request { .. } = next_event(&mut server_events).await else {
            panic!("expected a request event");
        };

        client.close();

        let RouterEvent::Disconnect { .. } = next_event(&mut server_events).await else {
            panic!("expected a disconnect event");
        };
        server.close();
    }

    #[tokio::test]
    async fn respond_without_requester_is_dropped() {
        let (router, _events) = Router::new(RouterConfig::default());
        // No such requester; the response is dropped with a log, not an error.
        router
            .respond(42, &PeerMessage::response_ok(1, json!(null)))
            .await
            .unwrap();
        router.close();
    }
}
