//! Dedicated WebSocket writer task.
//!
//! All outbound traffic goes through an mpsc channel to a single writer task,
//! avoiding contention on the WebSocket sink.

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, warn};

use super::protocol::ClientMessage;
use super::wait_for_stop;

/// Something to put on the wire.
#[derive(Debug)]
pub enum Outbound {
    Message(ClientMessage),
    /// Transport-level WebSocket ping.
    KeepAlive,
}

/// Sender half -- cloned by the dispatcher, request tasks, and heartbeat.
pub type OutboundSender = mpsc::Sender<Outbound>;

/// Spawn the writer task. Returns the sender and a JoinHandle for cleanup.
///
/// The task ends when every sender is dropped, a write fails, or a stop is
/// requested; it closes the sink on the way out.
pub fn spawn_writer<S>(
    mut sink: S,
    mut shutdown: watch::Receiver<bool>,
) -> (OutboundSender, JoinHandle<()>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    let handle = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                next = rx.recv() => match next {
                    Some(o) => o,
                    None => break,
                },
                _ = wait_for_stop(&mut shutdown) => {
                    debug!("writer stopping on request");
                    break;
                }
            };

            let message = match outbound {
                Outbound::Message(msg) => match msg.encode() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                },
                Outbound::KeepAlive => Message::Ping(Default::default()),
            };

            if let Err(e) = sink.send(message).await {
                error!(error = %e, "failed to write to WebSocket");
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
