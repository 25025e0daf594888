//! Transport keepalive: periodic WebSocket pings so idle connections stay
//! open and dead ones are noticed by the dispatcher's staleness check.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::writer::{Outbound, OutboundSender};

/// Spawn the keepalive task. Abort the handle when the connection ends.
pub fn spawn(interval: Duration, outbound: OutboundSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Skip the immediate first tick.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if outbound.send(Outbound::KeepAlive).await.is_err() {
                break; // Writer closed
            }
            debug!("sent keepalive ping");
        }
    })
}
