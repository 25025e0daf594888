//! Tunnel client engine: connect, authenticate, serve, and reconnect.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info};

use crate::auth::handshake;
use crate::auth::Signer;
use crate::config::TunnelConfig;
use crate::error::{ConfigError, ConnectionError, TunnelError};

use super::backoff::Backoff;
use super::bindings::PortBindings;
use super::forwarder::Forwarder;
use super::protocol::ClientMessage;
use super::state::{ConnectionState, StateMachine, TunnelEndpoint};
use super::writer::{self, Outbound, OutboundSender};
use super::{dispatcher, heartbeat, wait_for_stop};

/// Domain used for the derived endpoint URL when the relay URL has no host.
const FALLBACK_DOMAIN: &str = "tunnel.heavymeta.art";

/// How long a stopping session waits for the writer to flush its close frame.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests marshalled from a [`TunnelHandle`] onto the client task.
#[derive(Debug)]
pub(crate) enum Command {
    Bind { service: String, port: u16 },
    Unbind { service: String },
}

/// The tunnel engine. Owns the connection lifecycle; drive it with
/// [`run`](Self::run) or [`spawn`](Self::spawn) and control it from other
/// tasks or threads through a [`TunnelHandle`].
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    signer: Arc<dyn Signer>,
    forwarder: Arc<Forwarder>,
    limiter: Arc<Semaphore>,
    bindings: PortBindings,
    pub(crate) machine: StateMachine,
    backoff: Backoff,
    /// Relay identity; filled from the challenge when not configured.
    server_address: String,
    commands_tx: mpsc::UnboundedSender<Command>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    stop_tx: Arc<watch::Sender<bool>>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl TunnelClient {
    /// Build a client. The configuration is validated here, so a client that
    /// exists can always attempt a connection.
    pub fn new(config: TunnelConfig, signer: Arc<dyn Signer>) -> Result<Self, ConfigError> {
        config.validate()?;

        let forwarder = Forwarder::new(config.forward_timeout)
            .map_err(|e| ConfigError::new(format!("failed to build HTTP client: {e}")))?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (stop_tx, stop) = watch::channel(false);

        Ok(Self {
            backoff: Backoff::from_config(&config),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            server_address: config.server_address.clone(),
            config: Arc::new(config),
            signer,
            forwarder: Arc::new(forwarder),
            bindings: PortBindings::new(),
            machine: StateMachine::new(),
            commands_tx,
            commands,
            stop_tx: Arc::new(stop_tx),
            stop,
        })
    }

    pub fn on_state_changed(&mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.machine.callbacks.state_changed = Some(Box::new(f));
    }

    pub fn on_connected(&mut self, f: impl Fn(&TunnelEndpoint) + Send + Sync + 'static) {
        self.machine.callbacks.connected = Some(Box::new(f));
    }

    /// Fires only when an established connection is lost or closed.
    pub fn on_disconnected(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.machine.callbacks.disconnected = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.machine.callbacks.error = Some(Box::new(f));
    }

    pub fn on_endpoint_ready(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.machine.callbacks.endpoint_ready = Some(Box::new(f));
    }

    /// Record a service -> local port binding before the client runs.
    /// Bindings are announced to the relay after every successful handshake.
    pub fn bind_port(&mut self, service: impl Into<String>, port: u16) {
        let service = service.into();
        debug!(service = %service, port, "binding recorded");
        self.bindings.bind(service, port);
    }

    pub fn unbind_port(&mut self, service: &str) -> Option<u16> {
        self.bindings.unbind(service)
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn endpoint(&self) -> Option<Arc<TunnelEndpoint>> {
        self.machine.endpoint_slot().load_full()
    }

    pub fn identity(&self) -> String {
        self.signer.identity()
    }

    /// A cloneable, thread-safe handle for observing and controlling this client.
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            commands: self.commands_tx.clone(),
            stop: Arc::clone(&self.stop_tx),
            state: self.machine.subscribe(),
            endpoint: self.machine.endpoint_slot(),
            identity: Arc::from(self.signer.identity()),
        }
    }

    /// Run the client on its own task.
    pub fn spawn(mut self) -> (TunnelHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(async move { self.run().await });
        (handle, task)
    }

    /// Connect and keep the tunnel up until a disconnect is requested.
    ///
    /// Failed attempts go through `Error` and `Reconnecting` and are retried
    /// with exponential backoff. Once stopped, a client stays stopped.
    pub async fn run(&mut self) {
        info!(
            server = %self.config.server_url,
            identity = %self.signer.identity(),
            services = ?self.config.services,
            "starting tunnel"
        );
        self.drain_commands();

        while !self.stop_requested() {
            if let Err(e) = self.session().await {
                if self.stop_requested() {
                    break;
                }
                error!(error = %e, "tunnel connection failed");
                self.machine.fail(&e.to_string());
            }
            if self.stop_requested() {
                break;
            }

            self.machine.transition(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting tunnel");
            if !self.wait_before_retry(delay).await {
                break;
            }
        }

        self.machine.transition(ConnectionState::Disconnected);
        info!("tunnel stopped");
    }

    /// One connection attempt, from dial to loss. `Ok` means a stop was requested.
    async fn session(&mut self) -> Result<(), TunnelError> {
        let mut stop = self.stop.clone();

        self.machine.transition(ConnectionState::Connecting);
        info!(url = %self.config.server_url, "connecting tunnel");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.config.server_url.as_str()),
        );
        let connected = tokio::select! {
            r = connect => r,
            _ = wait_for_stop(&mut stop) => return Ok(()),
        };
        let (mut ws, _response) = connected
            .map_err(|_| ConnectionError::ConnectTimeout(self.config.connect_timeout))?
            .map_err(ConnectionError::Connect)?;

        self.machine.transition(ConnectionState::Authenticating);
        let grant = tokio::select! {
            r = handshake::authenticate(&mut ws, self.signer.as_ref(), &self.config, &self.server_address) => r,
            _ = wait_for_stop(&mut stop) => {
                let _ = ws.close(None).await;
                return Ok(());
            }
        }?;

        if grant.server_address != self.server_address {
            info!(server_address = %grant.server_address, "relay identity learned");
            self.server_address = grant.server_address.clone();
        }

        let client_address = self.signer.identity();
        let url = grant
            .endpoint
            .unwrap_or_else(|| self.fallback_endpoint_url(&client_address));
        info!(endpoint = %url, "tunnel connected");

        self.backoff.reset();
        self.machine.connected(TunnelEndpoint {
            url,
            client_address,
            server_address: grant.server_address,
            services: grant.services,
        });

        let (ws_sink, ws_read) = ws.split();
        let (outbound, mut writer_handle) = writer::spawn_writer(ws_sink, self.stop.clone());
        let hb_handle = heartbeat::spawn(self.config.keepalive_interval, outbound.clone());

        let result = self.serve(ws_read, &outbound, &mut writer_handle).await;

        hb_handle.abort();
        drop(outbound);

        match result {
            Ok(()) => {
                self.machine.transition(ConnectionState::Disconnected);
                let _ = tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut writer_handle).await;
                info!("tunnel disconnected");
                Ok(())
            }
            Err(e) => {
                writer_handle.abort();
                Err(e.into())
            }
        }
    }

    /// Announce every binding in registration order, then dispatch.
    async fn serve<S>(
        &mut self,
        ws_read: S,
        outbound: &OutboundSender,
        writer_handle: &mut JoinHandle<()>,
    ) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        for (service, port) in self.bindings.iter() {
            info!(service = %service, port, "binding service");
            outbound
                .send(Outbound::Message(ClientMessage::bind(service, port)))
                .await
                .map_err(|_| ConnectionError::WriterClosed)?;
        }

        dispatcher::run(self, ws_read, outbound, writer_handle).await
    }

    /// Sleep out a backoff delay while still accepting binding changes.
    /// Returns false if a stop was requested.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let mut stop = self.stop.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    let _ = self.apply_command(command);
                }
                _ = wait_for_stop(&mut stop) => return false,
            }
        }
    }

    /// Apply a handle command. Returns the message to send when the binding
    /// has to be announced on the live connection.
    pub(crate) fn apply_command(&mut self, command: Command) -> Option<ClientMessage> {
        match command {
            Command::Bind { service, port } => {
                self.bindings.bind(service.clone(), port);
                if self.machine.state() == ConnectionState::Connected {
                    info!(service = %service, port, "binding service");
                    Some(ClientMessage::bind(service, port))
                } else {
                    debug!(service = %service, port, "binding recorded");
                    None
                }
            }
            Command::Unbind { service } => {
                if let Some(port) = self.bindings.unbind(&service) {
                    info!(service = %service, port, "binding removed");
                }
                None
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            let _ = self.apply_command(command);
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Local port that forwarded requests are sent to.
    pub(crate) fn forward_port(&self) -> u16 {
        self.bindings
            .get(self.config.primary_service())
            .unwrap_or(self.config.default_local_port)
    }

    pub(crate) fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub(crate) fn forwarder(&self) -> Arc<Forwarder> {
        Arc::clone(&self.forwarder)
    }

    pub(crate) fn limiter(&self) -> Arc<Semaphore> {
        Arc::clone(&self.limiter)
    }

    fn fallback_endpoint_url(&self, client_address: &str) -> String {
        let domain = self
            .config
            .relay_host()
            .unwrap_or_else(|| FALLBACK_DOMAIN.to_string());
        format!("https://{client_address}.{domain}")
    }
}

/// Cloneable, thread-safe view of a running [`TunnelClient`].
///
/// Reads are served from shared snapshots; writes are queued to the client
/// task and applied in order.
#[derive(Clone)]
pub struct TunnelHandle {
    commands: mpsc::UnboundedSender<Command>,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConnectionState>,
    endpoint: Arc<ArcSwapOption<TunnelEndpoint>>,
    identity: Arc<str>,
}

impl TunnelHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint of the current connection; `None` unless connected.
    pub fn endpoint(&self) -> Option<Arc<TunnelEndpoint>> {
        self.endpoint.load_full()
    }

    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.load().as_ref().map(|e| e.url.clone())
    }

    /// The client's identity (hex public key).
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Bind `service` to a local port. Sent immediately when connected,
    /// otherwise after the next successful handshake.
    pub fn bind(&self, service: impl Into<String>, port: u16) {
        let _ = self.commands.send(Command::Bind {
            service: service.into(),
            port,
        });
    }

    /// Forget a binding locally; the relay is not notified.
    pub fn unbind(&self, service: impl Into<String>) {
        let _ = self.commands.send(Command::Unbind {
            service: service.into(),
        });
    }

    /// Request a stop. Safe to call from any thread and more than once.
    pub fn disconnect(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until the latest observed state equals `target`.
    /// Returns false if the client is gone first.
    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s == target).await.is_ok();
        reached
    }
}
