//! Gateway: the ingress point rented to one tunneled client.
//!
//! Listens on a leased port and presents the tunneled client to the rest
//! of the overlay. `POST /` carries one RPC envelope per request and is
//! answered when the tunneled client responds; a WebSocket upgrade on
//! `GET /` opens a data-channel session identified by a freshly minted
//! quid. Both kinds of traffic funnel into the session's outgoing frame
//! channel, consumed by the muxer.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use keyhole_core::{entrance_token, mint_quid, ChannelClose, Frame, TunnelError, TunnelResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

/// Close code reported upstream when a data-channel peer vanishes without
/// a close frame.
const ABNORMAL_CLOSE: u16 = 1006;
/// Close code reported when the peer's close frame carried no status.
const NO_STATUS: u16 = 1005;

/// One payload delivered to a data-channel peer.
#[derive(Debug)]
struct Delivery {
    binary: bool,
    payload: Vec<u8>,
}

/// State shared between the axum handlers and the gateway handle.
#[derive(Debug)]
struct Shared {
    /// Outgoing frames, consumed by the owning session's muxer.
    frame_tx: mpsc::Sender<Frame>,
    /// Responders for RPC requests still waiting on the tunneled client,
    /// oldest first.
    pending_rpc: Mutex<VecDeque<oneshot::Sender<Vec<u8>>>>,
    /// Live data-channel peers keyed by quid. Unbounded so the session
    /// loop never blocks behind a slow peer while that peer's task blocks
    /// behind the session loop.
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    max_channels: usize,
    closed: AtomicBool,
}

/// Server-side ingress listener for one tunneled client.
#[derive(Debug)]
pub struct Gateway {
    token: String,
    port: u16,
    shared: Arc<Shared>,
    frame_rx: std::sync::Mutex<Option<mpsc::Receiver<Frame>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    /// Bind the gateway listener and start serving.
    ///
    /// `port` 0 requests an OS-assigned port; the actual port is available
    /// via [`Gateway::port`]. A fresh single-use entrance token is minted
    /// per gateway. Fails with [`TunnelError::BindFailed`].
    pub async fn open(bind_addr: &str, port: u16, max_channels: usize) -> TunnelResult<Self> {
        let listener = TcpListener::bind((bind_addr, port))
            .await
            .map_err(|e| TunnelError::BindFailed(e.to_string()))?;
        let actual_port = listener
            .local_addr()
            .map_err(|e| TunnelError::BindFailed(e.to_string()))?
            .port();

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(256);
        let shared = Arc::new(Shared {
            frame_tx,
            pending_rpc: Mutex::new(VecDeque::new()),
            channels: Mutex::new(HashMap::new()),
            max_channels,
            closed: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/", get(channel_upgrade).post(rpc_call))
            .with_state(shared.clone());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let token = entrance_token();
        let gateway_port = actual_port;
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = serve.await {
                warn!(port = gateway_port, error = %e, "gateway listener error");
            }
            debug!(port = gateway_port, "gateway listener stopped");
        });

        Ok(Self {
            token,
            port: actual_port,
            shared,
            frame_rx: std::sync::Mutex::new(Some(frame_rx)),
            shutdown_tx,
        })
    }

    /// The single-use entrance token admitting the tunneled client.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The port the listener actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Take the outgoing frame stream; the session's muxer consumes it.
    ///
    /// Yields frames in the order gateway events produced them. Returns
    /// `None` if already taken.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Frame>> {
        match self.frame_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Fires when the gateway is closed; the owning session watches this
    /// so an explicit close also ends the tunnel session.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Deliver an RPC response to the oldest outstanding RPC request.
    pub async fn respond(&self, envelope: Vec<u8>) {
        let responder = self.shared.pending_rpc.lock().await.pop_front();
        match responder {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    debug!(port = self.port, "rpc caller went away before response");
                }
            }
            None => warn!(port = self.port, "rpc response with no outstanding request"),
        }
    }

    /// Deliver a data-channel payload to the peer identified by `quid`.
    ///
    /// Unknown quids are dropped: the peer may have disconnected while the
    /// frame was in flight.
    pub async fn transfer(&self, quid: &str, binary: bool, payload: Vec<u8>) {
        let sender = self.shared.channels.lock().await.get(quid).cloned();
        match sender {
            Some(tx) => {
                if tx.send(Delivery { binary, payload }).is_err() {
                    debug!(port = self.port, quid, "data channel closing, payload dropped");
                }
            }
            None => debug!(port = self.port, quid, "payload for unknown quid dropped"),
        }
    }

    /// Release the port and abort all open RPC responses and data-channel
    /// sessions. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        // Dropping the responders answers every in-flight RPC with 502;
        // dropping the senders ends every data-channel task.
        self.shared.pending_rpc.lock().await.clear();
        self.shared.channels.lock().await.clear();
        debug!(port = self.port, "gateway closed");
    }
}

/// `POST /` — one RPC envelope per request.
///
/// Queues a responder, forwards the envelope as an `rpc` frame, and blocks
/// until the tunneled client answers or the gateway dies.
async fn rpc_call(State(shared): State<Arc<Shared>>, body: Bytes) -> Response {
    if shared.closed.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let (tx, rx) = oneshot::channel::<Vec<u8>>();
    {
        // Held across the send so the responder queue order matches the
        // frame order seen by the tunneled client.
        let mut pending = shared.pending_rpc.lock().await;
        let frame = Frame::Rpc {
            payload: body.to_vec(),
        };
        if shared.frame_tx.send(frame).await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        pending.push_back(tx);
    }

    match rx.await {
        Ok(envelope) => (StatusCode::OK, envelope).into_response(),
        Err(_) => StatusCode::BAD_GATEWAY.into_response(),
    }
}

/// `GET /` — WebSocket upgrade opening one data-channel session.
async fn channel_upgrade(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    if shared.closed.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let quid = mint_quid();
    let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
    {
        let mut channels = shared.channels.lock().await;
        if channels.len() >= shared.max_channels {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        channels.insert(quid.clone(), tx);
    }

    ws.on_upgrade(move |socket| run_channel(shared, quid, rx, socket))
}

/// Bridge one data-channel peer: socket messages become `datachannel`
/// frames tagged with this session's quid; deliveries from the tunnel go
/// back out on the socket. On peer disconnect, a terminal frame carrying
/// `{code, message}` is emitted and the quid mapping is cleared.
async fn run_channel(
    shared: Arc<Shared>,
    quid: String,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    socket: WebSocket,
) {
    let (mut sink, mut stream) = socket.split();
    let mut close = ChannelClose {
        code: ABNORMAL_CLOSE,
        message: String::new(),
    };

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                match delivery {
                    Some(Delivery { binary, payload }) => {
                        let msg = if binary {
                            Message::Binary(payload.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&payload).into_owned().into())
                        };
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Gateway is closing: no terminal frame, the session
                    // is going away with us.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            inbound = stream.next() => {
                let frame = match inbound {
                    Some(Ok(Message::Binary(data))) => Frame::DataChannel {
                        quid: quid.clone(),
                        binary: true,
                        payload: data.to_vec(),
                    },
                    Some(Ok(Message::Text(text))) => Frame::DataChannel {
                        quid: quid.clone(),
                        binary: false,
                        payload: text.as_str().as_bytes().to_vec(),
                    },
                    Some(Ok(Message::Close(cf))) => {
                        if let Some(cf) = cf {
                            close.code = cf.code;
                            close.message = cf.reason.to_string();
                        } else {
                            close.code = NO_STATUS;
                        }
                        break;
                    }
                    // Pings are answered by the transport layer.
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => break,
                };
                if shared.frame_tx.send(frame).await.is_err() {
                    // Session gone; skip the terminal frame too.
                    return;
                }
            }
        }
    }

    let removed = shared.channels.lock().await.remove(&quid).is_some();
    if removed && !shared.closed.load(Ordering::SeqCst) {
        debug!(quid = %quid, code = close.code, "data channel peer disconnected");
        let _ = shared.frame_tx.send(close.into_frame(quid)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn open_gateway() -> (Gateway, mpsc::Receiver<Frame>) {
        let gateway = Gateway::open("127.0.0.1", 0, 16).await.unwrap();
        let frames = gateway.take_frames().unwrap();
        (gateway, frames)
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = Gateway::open("127.0.0.1", 0, 16).await.unwrap();
        let err = Gateway::open("127.0.0.1", first.port(), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindFailed(_)));
    }

    #[tokio::test]
    async fn rpc_round_trip() {
        let (gateway, mut frames) = open_gateway().await;
        let url = format!("http://127.0.0.1:{}/", gateway.port());

        let caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .body(&b"request-envelope"[..])
                .send()
                .await
                .unwrap()
        });

        match frames.recv().await.unwrap() {
            Frame::Rpc { payload } => assert_eq!(payload, b"request-envelope"),
            other => panic!("unexpected frame: {other:?}"),
        }

        gateway.respond(b"response-envelope".to_vec()).await;
        let response = caller.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(&response.bytes().await.unwrap()[..], b"response-envelope");
    }

    #[tokio::test]
    async fn data_channel_bridges_and_terminates() {
        let (gateway, mut frames) = open_gateway().await;
        let url = format!("ws://127.0.0.1:{}/", gateway.port());
        let (mut peer, _) = connect_async(&url).await.unwrap();

        peer.send(WsMessage::Binary(b"hello".to_vec().into()))
            .await
            .unwrap();
        let quid = match frames.recv().await.unwrap() {
            Frame::DataChannel {
                quid,
                binary,
                payload,
            } => {
                assert!(binary);
                assert_eq!(payload, b"hello");
                quid
            }
            other => panic!("unexpected frame: {other:?}"),
        };

        gateway.transfer(&quid, true, b"world".to_vec()).await;
        match peer.next().await.unwrap().unwrap() {
            WsMessage::Binary(data) => assert_eq!(&data[..], b"world"),
            other => panic!("unexpected message: {other:?}"),
        }

        peer.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();

        match frames.recv().await.unwrap() {
            Frame::DataChannel {
                quid: q,
                binary,
                payload,
            } => {
                assert_eq!(q, quid);
                assert!(!binary);
                let close: ChannelClose = serde_json::from_slice(&payload).unwrap();
                assert_eq!(close.code, 1000);
                assert_eq!(close.message, "bye");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn distinct_peers_get_distinct_quids() {
        let (gateway, mut frames) = open_gateway().await;
        let url = format!("ws://127.0.0.1:{}/", gateway.port());

        let (mut a, _) = connect_async(&url).await.unwrap();
        let (mut b, _) = connect_async(&url).await.unwrap();
        a.send(WsMessage::Binary(b"a".to_vec().into())).await.unwrap();
        let quid_a = frames.recv().await.unwrap().quid().unwrap().to_string();
        b.send(WsMessage::Binary(b"b".to_vec().into())).await.unwrap();
        let quid_b = frames.recv().await.unwrap().quid().unwrap().to_string();
        assert_ne!(quid_a, quid_b);
        drop(gateway);
    }

    #[tokio::test]
    async fn channel_cap_refuses_upgrade() {
        let gateway = Gateway::open("127.0.0.1", 0, 1).await.unwrap();
        let _frames = gateway.take_frames().unwrap();
        let url = format!("ws://127.0.0.1:{}/", gateway.port());

        let (_held, _) = connect_async(&url).await.unwrap();
        let err = connect_async(&url).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
