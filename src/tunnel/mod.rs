pub mod backoff;
pub mod bindings;
pub mod client;
pub mod dispatcher;
pub mod forwarder;
pub mod heartbeat;
pub mod protocol;
pub mod state;
pub mod writer;


pub use client::{TunnelClient, TunnelHandle};
pub use state::{ConnectionState, TunnelEndpoint};

use tokio::sync::watch;

/// Resolve once a stop has been requested. Never resolves if the stop
/// sender is gone without having signalled.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
