use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::common::errors::{ChatError, MALFORMED_REQUEST};
use crate::common::models::Identity;
use crate::common::protocol::{AuthMessage, AuthResponse, Reply, RequestEnvelope};
use crate::server::auth::Authenticator;
use crate::server::handlers::{self, AppContext};

// How long queued frames may take to flush once the client is gone
const WRITER_DRAIN: Duration = Duration::from_secs(1);

async fn send_frame<K>(sink: &mut K, frame: &impl Serialize) -> anyhow::Result<()>
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

fn auth_failure(error: impl Into<String>) -> AuthResponse {
    AuthResponse { success: false, user_id: None, error: Some(error.into()) }
}

/// Serves one WebSocket session: auth handshake, then request/reply plus pushed events
/// until the client goes away.
pub async fn serve_connection<S>(
    ws_stream: WebSocketStream<S>,
    ctx: AppContext,
    authenticator: Arc<dyn Authenticator>,
    peer: String,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    debug!("[WS:AUTH] Waiting for authentication from {}", peer);
    let first = tokio::time::timeout(Duration::from_secs(ctx.config.auth_timeout_secs), ws_receiver.next()).await;
    let auth = match first {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthMessage>(&text) {
            Ok(auth) => auth,
            Err(e) => {
                send_frame(&mut ws_sender, &auth_failure(format!("Expected auth frame: {}", e))).await?;
                return Err(anyhow::anyhow!("Invalid auth frame from {}", peer));
            }
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
            debug!("[WS:AUTH] {} closed the connection during auth", peer);
            return Ok(());
        }
        Ok(Some(Ok(_))) => {
            send_frame(&mut ws_sender, &auth_failure("Expected text message for authentication")).await?;
            return Err(anyhow::anyhow!("Unexpected frame during auth from {}", peer));
        }
        Ok(Some(Err(e))) => return Err(anyhow::anyhow!("WebSocket error during auth from {}: {}", peer, e)),
        Err(_) => {
            warn!("[WS:AUTH] Authentication timeout for {}", peer);
            send_frame(&mut ws_sender, &auth_failure("Authentication timeout")).await?;
            return Err(anyhow::anyhow!("Authentication timeout"));
        }
    };

    let identity = match authenticator.authenticate(&auth.token).await {
        Ok(identity) => identity,
        Err(e) => {
            send_frame(&mut ws_sender, &auth_failure("Invalid or expired session token")).await?;
            return Err(anyhow::anyhow!("Authentication failed for {}: {}", peer, e));
        }
    };
    let ok = AuthResponse { success: true, user_id: Some(identity.user_id.clone()), error: None };
    send_frame(&mut ws_sender, &ok).await?;
    info!("[WS:AUTH] {} authenticated as {}", peer, identity.user_id);

    let connection = ctx.router.connect(&identity.user_id).await;
    let connection_id = connection.id;
    let mut events = connection.events;
    let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(ctx.config.event_buffer.max(1));

    // Writer: replies and pushed events share the socket
    let mut writer = tokio::spawn(async move {
        let mut events_open = true;
        loop {
            let sent = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(reply) => send_frame(&mut ws_sender, &reply).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => send_frame(&mut ws_sender, &event).await,
                    None => {
                        // unregistered; keep flushing replies until the reader lets go
                        events_open = false;
                        continue;
                    }
                },
            };
            if let Err(e) = sent {
                debug!("[WS:SEND] Writer stopped: {}", e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                warn!("[WS:RECV] Ignoring binary frame from {}", identity.user_id);
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("[WS:RECV] Read error for {}: {}", identity.user_id, e);
                break;
            }
        };

        let reply = handle_frame(&ctx, &identity, &text).await;
        if reply_tx.send(reply).await.is_err() {
            break;
        }
    }

    ctx.router.disconnect(&identity.user_id, connection_id).await;
    drop(reply_tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        debug!("[WS:SEND] Writer for {} did not drain in time", identity.user_id);
        writer.abort();
    }
    info!("[WS] Connection {} of {} closed", connection_id, identity.user_id);
    Ok(())
}

async fn handle_frame(ctx: &AppContext, identity: &Identity, text: &str) -> Reply {
    let envelope = match serde_json::from_str::<RequestEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            // salvage the id so the client can match the failure
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                .unwrap_or(0);
            debug!("[WS:RECV] Malformed request from {}: {}", identity.user_id, e);
            return Reply::failure(id, &ChatError::validation("op", MALFORMED_REQUEST));
        }
    };

    match handlers::dispatch(ctx, identity, envelope.request).await {
        Ok(result) => Reply::success(envelope.id, result),
        Err(e) => {
            if e.status() == 500 {
                error!("[WS] Request {} of {} failed: {}", envelope.id, identity.user_id, e);
            } else {
                debug!("[WS] Request {} of {} rejected: {}", envelope.id, identity.user_id, e);
            }
            Reply::failure(envelope.id, &e)
        }
    }
}
