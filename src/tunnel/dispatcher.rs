//! Message dispatcher: reads relay messages in arrival order and routes them.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;

use super::client::TunnelClient;
use super::forwarder::Forwarder;
use super::protocol::{ClientMessage, ForwardedRequest, ForwardedResponse, RelayMessage};
use super::wait_for_stop;
use super::writer::{Outbound, OutboundSender};

/// Per-connection handles shared with request tasks.
struct Session<'a> {
    outbound: &'a OutboundSender,
    forwarder: Arc<Forwarder>,
    limiter: Arc<Semaphore>,
}

/// Run the dispatch loop until the connection fails or a stop is requested.
///
/// Returns `Ok(())` only for a requested stop; everything else (including a
/// clean close by the relay) is a connection failure.
pub async fn run<S>(
    client: &mut TunnelClient,
    mut ws_read: S,
    outbound: &OutboundSender,
    writer: &mut JoinHandle<()>,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let stale_after = client.config().keepalive_interval + client.config().keepalive_timeout;
    let session = Session {
        outbound,
        forwarder: client.forwarder(),
        limiter: client.limiter(),
    };
    let mut stop = client.stop.clone();

    // Any inbound frame proves the connection is alive
    let mut last_data_at = Instant::now();

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket read error");
                        return Err(e.into());
                    }
                    None => return Err(ConnectionError::Closed),
                };
                last_data_at = Instant::now();

                match msg {
                    Message::Text(text) => handle_message(client, &session, &text).await?,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_message(client, &session, text).await?,
                        Err(_) => warn!(len = data.len(), "ignoring non-UTF-8 binary message"),
                    },
                    Message::Close(frame) => {
                        info!(frame = ?frame, "received WebSocket close");
                        return Err(ConnectionError::Closed);
                    }
                    _ => {}
                }
            }
            Some(command) = client.commands.recv() => {
                if let Some(msg) = client.apply_command(command) {
                    send(outbound, msg).await?;
                }
            }
            _ = tokio::time::sleep_until(last_data_at + stale_after) => {
                warn!(stale_secs = stale_after.as_secs(), "tunnel connection stale, no data received");
                return Err(ConnectionError::Stale(stale_after));
            }
            _ = &mut *writer => {
                return Err(ConnectionError::WriterClosed);
            }
            _ = wait_for_stop(&mut stop) => {
                debug!("stop requested during dispatch");
                return Ok(());
            }
        }
    }
}

async fn handle_message(
    client: &mut TunnelClient,
    session: &Session<'_>,
    text: &str,
) -> Result<(), ConnectionError> {
    let msg = match RelayMessage::decode(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(
                error = %e,
                message = %text.chars().take(100).collect::<String>(),
                "ignoring malformed message"
            );
            return Ok(());
        }
    };

    match msg {
        RelayMessage::Ping => {
            // Waits for room so a busy writer delays the pong rather than losing it
            send(session.outbound, ClientMessage::Pong).await?;
            debug!("answered keepalive ping");
        }

        RelayMessage::TunnelRequest { stream_id, request } => {
            spawn_request(client.forward_port(), session, stream_id, request);
        }

        RelayMessage::BindOk { service } => {
            info!(service = service.as_deref().unwrap_or("?"), "service bound");
        }

        RelayMessage::Error { message } => {
            let message = message.unwrap_or_else(|| "Unknown server error".to_string());
            error!(message = %message, "relay reported an error");
            client.machine.report_error(&message);
        }

        other => {
            debug!(kind = other.kind(), "ignoring unexpected message");
        }
    }
    Ok(())
}

/// Handle one forwarded request on its own task. Responses are correlated by
/// `stream_id`, so completion order does not matter.
fn spawn_request(port: u16, session: &Session<'_>, stream_id: u64, request: ForwardedRequest) {
    let Ok(permit) = Arc::clone(&session.limiter).try_acquire_owned() else {
        warn!(stream_id, "max concurrent requests reached");
        let busy = ClientMessage::TunnelResponse {
            stream_id,
            response: ForwardedResponse::text(503, "Tunnel client busy: too many concurrent requests"),
        };
        if session.outbound.try_send(Outbound::Message(busy)).is_err() {
            warn!(stream_id, "writer channel full, busy response dropped");
        }
        return;
    };

    let forwarder = Arc::clone(&session.forwarder);
    let outbound = session.outbound.clone();
    debug!(stream_id, method = %request.method, path = %request.path, port, "forwarding request");

    tokio::spawn(async move {
        let _permit = permit;
        let response = forwarder.forward(port, &request).await;
        let status = response.status_code;
        let msg = ClientMessage::TunnelResponse {
            stream_id,
            response,
        };
        if outbound.send(Outbound::Message(msg)).await.is_err() {
            debug!(stream_id, "connection gone, response dropped");
        } else {
            debug!(stream_id, status, "response sent");
        }
    });
}

async fn send(outbound: &OutboundSender, msg: ClientMessage) -> Result<(), ConnectionError> {
    outbound
        .send(Outbound::Message(msg))
        .await
        .map_err(|_| ConnectionError::WriterClosed)
}
