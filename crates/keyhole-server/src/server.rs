//! Core tunnel server: admits authorized tunneled clients, owns the
//! bounded gateway set, and forwards frames between overlay peers and the
//! tunneled client.
//!
//! Admission is out-of-band: `create_gateway` (invoked through the
//! overlay's RPC, never over the tunnel socket) leases a port, opens a
//! gateway, and returns its entrance token. The client then upgrades a
//! WebSocket at `/tun?token=…`; the token is verified and consumed during
//! the HTTP upgrade, so an unknown or reused token is rejected with 401.

use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::registry::Registry;
use futures_util::{SinkExt, StreamExt};
use keyhole_core::close_code;
use keyhole_core::{encode_frame, Demuxer, Frame, TunnelError, TunnelResult};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// URL path the tunnel upgrade listens on.
const TUNNEL_PATH: &str = "/tun";

/// Events surfaced to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// The `/tun` listener is bound.
    Ready,
    /// The gateway cap was just reached.
    Locked,
    /// A slot just freed below the cap.
    Unlocked,
}

/// What `create_gateway` hands back to the caller: the public ingress
/// port and the single-use entrance token.
#[derive(Debug, Clone)]
pub struct GatewayGrant {
    pub port: u16,
    pub token: String,
}

/// The tunnel server instance.
pub struct TunnelServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    events: broadcast::Sender<ServerEvent>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(
            config.max_tunnels,
            config.port_min,
            config.port_max,
        ));
        let (events, _) = broadcast::channel(16);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            events,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Bind onto an externally managed listener instead of `config.port`.
    pub fn with_listener(config: ServerConfig, listener: TcpListener) -> Self {
        let server = Self::new(config);
        if let Ok(addr) = listener.local_addr() {
            *lock(&server.local_addr) = Some(addr);
        }
        *lock(&server.listener) = Some(listener);
        server
    }

    /// Subscribe to `ready` / `locked` / `unlocked` events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Address of the `/tun` listener, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind the `/tun` listener.
    ///
    /// A no-op if a listener is already bound (explicitly or via
    /// [`TunnelServer::with_listener`]).
    pub async fn open(&self) -> TunnelResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind((self.config.bind_addr.as_str(), self.config.port))
            .await
            .map_err(|e| TunnelError::Transport(format!("tunnel listener bind: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        *lock(&self.local_addr) = Some(addr);
        *lock(&self.listener) = Some(listener);
        Ok(addr)
    }

    /// Accept tunnel upgrades until [`TunnelServer::shutdown`].
    ///
    /// Binds implicitly when `auto_bind` is set; otherwise [`open`] must
    /// have been called first.
    ///
    /// [`open`]: TunnelServer::open
    pub async fn run(self: Arc<Self>) -> TunnelResult<()> {
        if self.local_addr().is_none() {
            if !self.config.auto_bind {
                return Err(TunnelError::Transport(
                    "server not bound and auto_bind is off; call open() first".into(),
                ));
            }
            self.open().await?;
        }
        let listener = lock(&self.listener)
            .take()
            .ok_or_else(|| TunnelError::Transport("tunnel listener already running".into()))?;
        info!(addr = ?self.local_addr(), "tunnel server ready");
        let _ = self.events.send(ServerEvent::Ready);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, remote).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "tunnel accept failed"),
                    }
                }
            }
        }

        // Tear down every remaining gateway on the way out.
        for token in self.registry.tokens() {
            self.release(&token).await;
        }
        info!("tunnel server stopped");
        Ok(())
    }

    /// Stop accepting upgrades and close all sessions.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Allocate a gateway for a would-be tunneled client.
    ///
    /// Enforces the gateway cap, leases a port, binds the gateway, and
    /// authorizes its entrance token. Errors (`TunnelsExhausted`,
    /// `NoFreePort`, `BindFailed`) surface synchronously to the caller.
    pub async fn create_gateway(&self) -> TunnelResult<GatewayGrant> {
        let lease = self.registry.lease()?;
        let gateway =
            match Gateway::open(&self.config.bind_addr, lease.port(), self.config.max_channels)
                .await
            {
                Ok(gateway) => Arc::new(gateway),
                Err(e) => {
                    self.registry.abort(lease);
                    return Err(e);
                }
            };

        let grant = GatewayGrant {
            port: gateway.port(),
            token: gateway.token().to_string(),
        };
        let locked = self.registry.commit(lease, gateway);
        info!(port = grant.port, live = self.registry.live_gateways(), "gateway created");
        if locked {
            let _ = self.events.send(ServerEvent::Locked);
        }
        Ok(grant)
    }

    /// Explicitly close a gateway, releasing its port and slot.
    ///
    /// Its token stays redeemable; a client upgrading with it later is
    /// accepted and immediately closed with `GATEWAY_CLOSED`. Returns
    /// whether the gateway existed.
    pub async fn close_gateway(&self, token: &str) -> bool {
        self.release(token).await
    }

    /// Number of live gateways; test and introspection hook.
    pub fn live_gateways(&self) -> usize {
        self.registry.live_gateways()
    }

    /// Currently leased gateway ports.
    pub fn used_ports(&self) -> Vec<u16> {
        self.registry.used_ports()
    }

    async fn release(&self, token: &str) -> bool {
        match self.registry.release(token) {
            Some((gateway, was_at_cap)) => {
                gateway.close().await;
                info!(port = gateway.port(), live = self.registry.live_gateways(), "gateway released");
                if was_at_cap {
                    let _ = self.events.send(ServerEvent::Unlocked);
                }
                true
            }
            None => false,
        }
    }

    /// Upgrade one inbound connection and run its session to completion.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let registry = self.registry.clone();
        let mut admitted: Option<String> = None;
        let callback = |req: &Request, resp: Response| match verify_upgrade(&registry, req) {
            Ok(token) => {
                admitted = Some(token);
                Ok(resp)
            }
            Err(status) => {
                let mut err = ErrorResponse::new(None);
                *err.status_mut() = status;
                Err(err)
            }
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %remote, error = %e, "tunnel upgrade rejected");
                return;
            }
        };
        let Some(token) = admitted else {
            return;
        };

        match self.registry.gateway(&token) {
            Some(gateway) => {
                info!(remote = %remote, port = gateway.port(), "tunnel session established");
                self.run_session(ws, &token, gateway).await;
            }
            None => {
                // Token was valid but its gateway is gone (S6 in the
                // admission contract): accept, then close with the reason.
                debug!(remote = %remote, "token redeemed for a closed gateway");
                let mut ws = ws;
                close_with(&mut ws, close_code::GATEWAY_CLOSED, "gateway closed").await;
            }
        }
    }

    /// One session: gateway frames out through the muxer, transport bytes
    /// in through the demuxer. Codec errors abort this session only.
    async fn run_session(
        &self,
        mut ws: WebSocketStream<TcpStream>,
        token: &str,
        gateway: Arc<Gateway>,
    ) {
        let Some(mut frames) = gateway.take_frames() else {
            close_with(&mut ws, close_code::UNEXPECTED, "gateway already attached").await;
            self.release(token).await;
            return;
        };
        let mut demux = Demuxer::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut gateway_closed = gateway.closed_signal();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws.close(None).await;
                        break;
                    }
                }

                // Explicit gateway close ends the session, not just the
                // gateway's listener.
                changed = gateway_closed.changed() => {
                    if changed.is_err() || *gateway_closed.borrow() {
                        close_with(&mut ws, close_code::GATEWAY_CLOSED, "gateway closed").await;
                        break;
                    }
                }

                frame = frames.recv() => {
                    match frame {
                        Some(frame) => match encode_frame(&frame) {
                            Ok(buf) => {
                                if ws.send(Message::Binary(buf.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "gateway produced an unencodable frame");
                                close_with(&mut ws, close_code::UNEXPECTED, &e.to_string()).await;
                                break;
                            }
                        },
                        // Gateway closed underneath the session.
                        None => {
                            close_with(&mut ws, close_code::GATEWAY_CLOSED, "gateway closed").await;
                            break;
                        }
                    }
                }

                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => match demux.feed(&data) {
                            Ok(decoded) => {
                                for frame in decoded {
                                    match frame {
                                        Frame::Rpc { payload } => gateway.respond(payload).await,
                                        Frame::DataChannel { quid, binary, payload } => {
                                            gateway.transfer(&quid, binary, payload).await;
                                        }
                                    }
                                }
                            }
                            Err(e @ TunnelError::UnknownFrameType(_)) => {
                                debug!(error = %e, "closing session");
                                close_with(&mut ws, close_code::INVALID_FRAME_TYPE, &e.to_string())
                                    .await;
                                break;
                            }
                            Err(e) => {
                                debug!(error = %e, "closing session");
                                close_with(&mut ws, close_code::UNEXPECTED, &e.to_string()).await;
                                break;
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("tunnel session ended by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "tunnel session transport error");
                            break;
                        }
                    }
                }
            }
        }

        self.release(token).await;
    }
}

/// Verify the upgrade request: path must be `/tun`, and the `token` query
/// parameter must be present and still authorized. Consuming the token
/// here makes removal atomic with acceptance.
fn verify_upgrade(registry: &Registry, req: &Request) -> Result<String, StatusCode> {
    if req.uri().path() != TUNNEL_PATH {
        return Err(StatusCode::NOT_FOUND);
    }
    let token = req
        .uri()
        .query()
        .and_then(token_param)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if registry.consume_token(&token) {
        Ok(token)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn token_param(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix("token="))
        .map(str::to_string)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn test_config(max_tunnels: usize) -> ServerConfig {
        ServerConfig {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            auto_bind: true,
            max_tunnels,
            port_min: None,
            port_max: 0,
            max_channels: 16,
        }
    }

    async fn started(config: ServerConfig) -> (Arc<TunnelServer>, SocketAddr) {
        let server = Arc::new(TunnelServer::new(config));
        let addr = server.open().await.unwrap();
        tokio::spawn(server.clone().run());
        (server, addr)
    }

    fn tunnel_url(addr: SocketAddr, token: &str) -> String {
        format!("ws://{addr}/tun?token={token}")
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn cap_enforcement_and_lock_signals() {
        let server = Arc::new(TunnelServer::new(test_config(2)));
        let mut events = server.subscribe();

        let first = server.create_gateway().await.unwrap();
        let second = server.create_gateway().await.unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(events.recv().await.unwrap(), ServerEvent::Locked);

        assert!(matches!(
            server.create_gateway().await,
            Err(TunnelError::TunnelsExhausted)
        ));

        assert!(server.close_gateway(&first.token).await);
        assert_eq!(events.recv().await.unwrap(), ServerEvent::Unlocked);
        assert!(server.create_gateway().await.is_ok());
    }

    #[tokio::test]
    async fn port_range_is_leased_without_duplicates() {
        let mut config = test_config(5);
        config.port_min = Some(41873);
        config.port_max = 41874;
        let server = Arc::new(TunnelServer::new(config));

        let a = server.create_gateway().await.unwrap();
        let b = server.create_gateway().await.unwrap();
        let mut ports = vec![a.port, b.port];
        ports.sort_unstable();
        assert_eq!(ports, vec![41873, 41874]);
        assert_eq!(server.used_ports(), vec![41873, 41874]);

        assert!(matches!(
            server.create_gateway().await,
            Err(TunnelError::NoFreePort)
        ));

        server.close_gateway(&a.token).await;
        assert_eq!(server.used_ports(), vec![41874]);
    }

    #[tokio::test]
    async fn admission_token_is_one_shot() {
        let (server, addr) = started(test_config(1)).await;
        let grant = server.create_gateway().await.unwrap();

        let (ws, _) = connect_async(tunnel_url(addr, &grant.token)).await.unwrap();
        drop(ws);

        match connect_async(tunnel_url(addr, &grant.token)).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected 401, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_and_wrong_path_are_rejected() {
        let (_server, addr) = started(test_config(1)).await;

        match connect_async(tunnel_url(addr, "deadbeef")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected 401, got {other:?}"),
        }
        match connect_async(format!("ws://{addr}/other?token=x")).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
            other => panic!("expected 404, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_token_gets_gateway_closed() {
        let (server, addr) = started(test_config(1)).await;
        let grant = server.create_gateway().await.unwrap();
        assert!(server.close_gateway(&grant.token).await);

        let (mut ws, _) = connect_async(tunnel_url(addr, &grant.token)).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), close_code::GATEWAY_CLOSED);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closing_gateway_ends_active_session() {
        let (server, addr) = started(test_config(1)).await;
        let grant = server.create_gateway().await.unwrap();

        let (mut ws, _) = connect_async(tunnel_url(addr, &grant.token)).await.unwrap();
        assert!(server.close_gateway(&grant.token).await);

        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), close_code::GATEWAY_CLOSED);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(server.live_gateways(), 0);
    }

    #[tokio::test]
    async fn malformed_frame_closes_session_and_releases_gateway() {
        let (server, addr) = started(test_config(1)).await;
        let grant = server.create_gateway().await.unwrap();

        let (mut ws, _) = connect_async(tunnel_url(addr, &grant.token)).await.unwrap();
        ws.send(Message::Binary(vec![0xff, 0x00, 0x01].into()))
            .await
            .unwrap();

        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), close_code::INVALID_FRAME_TYPE);
            }
            other => panic!("expected close frame, got {other:?}"),
        }

        let server2 = server.clone();
        wait_for(move || server2.live_gateways() == 0).await;
    }

    #[tokio::test]
    async fn rpc_frames_flow_between_overlay_peer_and_client() {
        let (server, addr) = started(test_config(1)).await;
        let grant = server.create_gateway().await.unwrap();
        let (mut ws, _) = connect_async(tunnel_url(addr, &grant.token)).await.unwrap();

        // Overlay peer posts an envelope at the gateway.
        let rpc_url = format!("http://127.0.0.1:{}/", grant.port);
        let caller = tokio::spawn(async move {
            reqwest::Client::new()
                .post(rpc_url)
                .body(&b"B1"[..])
                .send()
                .await
                .unwrap()
        });

        // The tunneled client sees it as an rpc frame...
        let frame = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => {
                    let mut demux = Demuxer::new();
                    break demux.feed(&data).unwrap().remove(0);
                }
                Message::Ping(p) => {
                    let _ = ws.send(Message::Pong(p)).await;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        };
        assert_eq!(
            frame,
            Frame::Rpc {
                payload: b"B1".to_vec()
            }
        );

        // ...and answers through the muxer.
        let reply = encode_frame(&Frame::Rpc {
            payload: b"B2".to_vec(),
        })
        .unwrap();
        ws.send(Message::Binary(reply.into())).await.unwrap();

        let response = caller.await.unwrap();
        assert_eq!(&response.bytes().await.unwrap()[..], b"B2");
        drop(server);
    }
}
