//! Loopback data-channel bridging.
//!
//! One task per quid owns the loopback WebSocket. Deliveries that arrive
//! while the socket is still connecting sit in the task's queue and are
//! flushed in order once it opens; they are never dropped. When the
//! loopback closes with `(code, message)`, the task emits one terminal
//! frame carrying that pair as JSON and reports the quid for removal.

use crate::client::ClientEvent;
use futures_util::{SinkExt, StreamExt};
use keyhole_core::{ChannelClose, Frame, TunnelError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const ABNORMAL_CLOSE: u16 = 1006;
const NO_STATUS: u16 = 1005;

/// One payload headed for the loopback socket.
pub(crate) struct Delivery {
    pub binary: bool,
    pub payload: Vec<u8>,
}

pub(crate) async fn run_channel(
    quid: String,
    url: String,
    connect_timeout: Duration,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    out_tx: mpsc::Sender<Frame>,
    closed_tx: mpsc::Sender<String>,
    events: broadcast::Sender<ClientEvent>,
) {
    let ws = match tokio::time::timeout(connect_timeout, connect_async(&url)).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            let failure = TunnelError::LoopbackFailure(e.to_string());
            let _ = events.send(ClientEvent::Error(failure.to_string()));
            terminate(quid, ABNORMAL_CLOSE, "loopback connect failed", &out_tx, &closed_tx).await;
            return;
        }
        Err(_) => {
            let failure = TunnelError::LoopbackFailure("loopback connect timed out".into());
            let _ = events.send(ClientEvent::Error(failure.to_string()));
            terminate(quid, ABNORMAL_CLOSE, "loopback connect timed out", &out_tx, &closed_tx)
                .await;
            return;
        }
    };
    debug!(quid = %quid, url = %url, "loopback channel open");

    let (mut sink, mut stream) = ws.split();
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
                    // Tunnel is closing; drop the loopback quietly.
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
                            close.code = cf.code.into();
                            close.message = cf.reason.to_string();
                        } else {
                            close.code = NO_STATUS;
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let failure = TunnelError::LoopbackFailure(e.to_string());
                        let _ = events.send(ClientEvent::Error(failure.to_string()));
                        break;
                    }
                    None => break,
                };
                if out_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }

    debug!(quid = %quid, code = close.code, "loopback channel closed");
    let message = std::mem::take(&mut close.message);
    terminate(quid, close.code, &message, &out_tx, &closed_tx).await;
}

/// Emit the terminal frame for `quid`, then report it for removal.
async fn terminate(
    quid: String,
    code: u16,
    message: &str,
    out_tx: &mpsc::Sender<Frame>,
    closed_tx: &mpsc::Sender<String>,
) {
    let close = ChannelClose {
        code,
        message: message.to_string(),
    };
    let _ = out_tx.send(close.into_frame(quid.clone())).await;
    let _ = closed_tx.send(quid).await;
}
