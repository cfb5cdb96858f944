//! Tunnel client state machine.
//!
//! `open()` dials the tunnel server, then a single task owns the socket,
//! the demuxer, and the data-channel map for the session's lifetime.
//! Inbound frames bridge to loopback endpoints; loopback traffic and RPC
//! responses merge back into one outgoing frame channel consumed by the
//! muxer.

use crate::channels::{self, Delivery};
use crate::rpc;
use futures_util::{SinkExt, StreamExt};
use keyhole_core::{encode_frame, Demuxer, Frame, TunnelError, TunnelResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tunnel endpoint: `ws://host:port/tun?token=…`.
    pub tunnel_uri: String,
    /// Loopback HTTP endpoint that accepts POSTed RPC envelope bytes.
    pub target_rpc_uri: String,
    /// Loopback data-channel endpoint; derived from `target_rpc_uri`'s
    /// host and port when unset.
    pub target_channel_uri: Option<String>,
    /// Bound on loopback data-channel connection establishment.
    pub connect_timeout: Duration,
    /// Bound on one forwarded RPC round trip.
    pub rpc_timeout: Duration,
}

impl ClientConfig {
    pub fn new(tunnel_uri: impl Into<String>, target_rpc_uri: impl Into<String>) -> Self {
        Self {
            tunnel_uri: tunnel_uri.into(),
            target_rpc_uri: target_rpc_uri.into(),
            target_channel_uri: None,
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Events surfaced to embedders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Open,
    Close,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Open,
    Closed,
}

struct ActiveTunnel {
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    config: ClientConfig,
    http: reqwest::Client,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<Option<ActiveTunnel>>,
}

impl Inner {
    /// Mark the session closed and emit `close` exactly once.
    fn finish_session(&self) {
        if lock(&self.active).take().is_some() {
            let _ = self.events.send(ClientEvent::Close);
        }
    }
}

/// The tunneled client: terminates the remote end of a tunnel and proxies
/// frames to loopback RPC and data-channel endpoints.
pub struct TunnelClient {
    inner: Arc<Inner>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                http: reqwest::Client::builder().build().unwrap_or_default(),
                events,
                active: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to `open` / `close` / `error` events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn ready_state(&self) -> ReadyState {
        if lock(&self.inner.active).is_some() {
            ReadyState::Open
        } else {
            ReadyState::Closed
        }
    }

    /// Establish the tunnel.
    ///
    /// Transitions to `Open` and emits `open` only once the transport
    /// reports open. A 401 on the upgrade surfaces as
    /// [`TunnelError::AdmissionDenied`].
    pub async fn open(&self) -> TunnelResult<()> {
        if self.ready_state() == ReadyState::Open {
            return Err(TunnelError::Transport("tunnel already open".into()));
        }
        let channel_url = self.loopback_channel_url()?;

        let (ws, _) = connect_async(&self.inner.config.tunnel_uri)
            .await
            .map_err(|e| match e {
                WsError::Http(ref response) if response.status() == 401 => {
                    TunnelError::AdmissionDenied
                }
                e => TunnelError::Transport(e.to_string()),
            })?;
        info!(uri = %self.inner.config.tunnel_uri, "tunnel open");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock(&self.inner.active) = Some(ActiveTunnel { shutdown_tx });
        tokio::spawn(run_loop(self.inner.clone(), ws, channel_url, shutdown_rx));
        let _ = self.inner.events.send(ClientEvent::Open);
        Ok(())
    }

    /// Tear the tunnel down. Idempotent.
    ///
    /// Cancels pending RPC forwards and loopback sessions, closes the
    /// transport, and emits `close`. Returns `false` when no tunnel was
    /// active.
    pub fn close(&self) -> bool {
        match lock(&self.inner.active).take() {
            Some(active) => {
                let _ = active.shutdown_tx.send(true);
                let _ = self.inner.events.send(ClientEvent::Close);
                info!("tunnel closed");
                true
            }
            None => false,
        }
    }

    /// The loopback data-channel URL: configured explicitly, or the RPC
    /// endpoint's host and port with a `ws` scheme.
    fn loopback_channel_url(&self) -> TunnelResult<String> {
        if let Some(url) = &self.inner.config.target_channel_uri {
            return Ok(url.clone());
        }
        let url = reqwest::Url::parse(&self.inner.config.target_rpc_uri)
            .map_err(|e| TunnelError::Transport(format!("bad target_rpc_uri: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::Transport("target_rpc_uri has no host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TunnelError::Transport("target_rpc_uri has no port".into()))?;
        Ok(format!("ws://{host}:{port}"))
    }
}

/// Session task: owns the transport, the demuxer, and the channel map.
async fn run_loop(
    inner: Arc<Inner>,
    mut ws: Transport,
    channel_url: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    let (closed_tx, mut closed_rx) = mpsc::channel::<String>(64);
    let mut channels: HashMap<String, mpsc::UnboundedSender<Delivery>> = HashMap::new();
    let mut rpc_forwards = tokio::task::JoinSet::new();
    let mut demux = Demuxer::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = ws.close(None).await;
                    break;
                }
            }

            Some(quid) = closed_rx.recv() => {
                channels.remove(&quid);
            }

            // Reap finished forwards so the set stays small.
            Some(_) = rpc_forwards.join_next(), if !rpc_forwards.is_empty() => {}

            frame = out_rx.recv() => {
                // `out_tx` is held here too, so recv never yields None.
                let Some(frame) = frame else { break };
                match encode_frame(&frame) {
                    Ok(buf) => {
                        if ws.send(Message::Binary(buf.into())).await.is_err() {
                            let _ = inner.events.send(ClientEvent::Error(
                                TunnelError::Transport("tunnel send failed".into()).to_string(),
                            ));
                            break;
                        }
                    }
                    Err(e) => {
                        // An unencodable frame from a collaborator; drop
                        // it, the tunnel itself is fine.
                        let _ = inner.events.send(ClientEvent::Error(e.to_string()));
                    }
                }
            }

            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match demux.feed(&data) {
                        Ok(decoded) => {
                            for frame in decoded {
                                handle_frame(
                                    &inner,
                                    &mut channels,
                                    &mut rpc_forwards,
                                    &channel_url,
                                    &out_tx,
                                    &closed_tx,
                                    frame,
                                )
                                .await;
                            }
                        }
                        Err(e) => {
                            let _ = inner.events.send(ClientEvent::Error(e.to_string()));
                            let _ = ws.close(None).await;
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("tunnel ended by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inner.events.send(ClientEvent::Error(
                            TunnelError::Transport(e.to_string()).to_string(),
                        ));
                        break;
                    }
                }
            }
        }
    }

    // Dropping the channel map ends every loopback task; aborting the
    // join set cancels every in-flight RPC forward.
    drop(channels);
    rpc_forwards.abort_all();
    inner.finish_session();
}

/// Route one decoded frame.
async fn handle_frame(
    inner: &Arc<Inner>,
    channels: &mut HashMap<String, mpsc::UnboundedSender<Delivery>>,
    rpc_forwards: &mut tokio::task::JoinSet<()>,
    channel_url: &str,
    out_tx: &mpsc::Sender<Frame>,
    closed_tx: &mpsc::Sender<String>,
    frame: Frame,
) {
    match frame {
        Frame::Rpc { payload } => {
            rpc_forwards.spawn(rpc::forward(
                inner.http.clone(),
                inner.config.target_rpc_uri.clone(),
                inner.config.rpc_timeout,
                payload,
                out_tx.clone(),
                inner.events.clone(),
            ));
        }
        Frame::DataChannel {
            quid,
            binary,
            payload,
        } => {
            let mut delivery = Delivery { binary, payload };
            if let Some(tx) = channels.get(&quid) {
                match tx.send(delivery) {
                    Ok(()) => return,
                    // The channel task died before its removal was
                    // processed; reopen under the same quid.
                    Err(mpsc::error::SendError(returned)) => {
                        channels.remove(&quid);
                        delivery = returned;
                    }
                }
            }

            let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
            // Queued ahead of the connect; flushed once the loopback opens.
            let _ = tx.send(delivery);
            channels.insert(quid.clone(), tx);
            tokio::spawn(channels::run_channel(
                quid,
                channel_url.to_string(),
                inner.config.connect_timeout,
                rx,
                out_tx.clone(),
                closed_tx.clone(),
                inner.events.clone(),
            ));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
