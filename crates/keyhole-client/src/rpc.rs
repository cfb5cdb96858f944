//! RPC forwarding: inbound `rpc` frames become POSTs against the loopback
//! RPC endpoint; the response body goes back through the muxer.
//!
//! Failures are reported as `error` events and never tear down the
//! tunnel: other multiplexed sessions continue.

use crate::client::ClientEvent;
use keyhole_core::{Frame, TunnelError};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

pub(crate) async fn forward(
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    envelope: Vec<u8>,
    out_tx: mpsc::Sender<Frame>,
    events: broadcast::Sender<ClientEvent>,
) {
    let result = http
        .post(&url)
        .timeout(timeout)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(envelope)
        .send()
        .await;

    let failure = match result {
        Ok(response) if response.status().is_success() => match response.bytes().await {
            Ok(body) => {
                debug!(bytes = body.len(), "rpc forwarded");
                let _ = out_tx
                    .send(Frame::Rpc {
                        payload: body.to_vec(),
                    })
                    .await;
                return;
            }
            Err(e) => TunnelError::UpstreamRpcFailure(e.to_string()),
        },
        Ok(response) => TunnelError::UpstreamRpcFailure(format!(
            "rpc endpoint answered {}",
            response.status()
        )),
        Err(e) => TunnelError::UpstreamRpcFailure(e.to_string()),
    };

    debug!(error = %failure, "rpc forward failed");
    let _ = events.send(ClientEvent::Error(failure.to_string()));
}
