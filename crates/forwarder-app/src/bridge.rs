//! The forwarder proper: couples the SOE engine on the UDP side with the
//! Holocore client on the TCP side.
//!
//! Five kinds of task share one `Shared` state:
//!
//! * the UDP receive loops, which feed every datagram into the client loop,
//! * the client loop, which runs datagrams through the engine,
//! * the resend loop, which ticks the engine's retransmission timer,
//! * the client heartbeat loop, which keeps an idle client session alive,
//! * the backend supervisor, which connects on request and pumps backend
//!   payloads to the client until the connection ends.
//!
//! The engine lock is released before any engine output is dispatched. When
//! the backend slot and the interceptor are both needed, the slot is locked
//! first.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use forwarder_config::ForwarderConfig;
use forwarder_net::interceptor::classify;
use forwarder_net::messages::HeartBeat;
use forwarder_net::reconnection::connect_with_backoff;
use forwarder_net::{
    ConnectionStoppedReason, HolocoreClient, HolocoreConfig, NetInterceptor, ReconnectConfig,
    ReconnectError, Route, SwgMessage,
};
use forwarder_soe::{
    ClientServer, Datagram, EngineConfig, EngineEvent, EngineOutput, SessionState, SoeEngine,
    UdpListeners,
};
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::events::{BridgeEvent, EventBus};

/// How long [`Bridge::shutdown`] waits for each task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Period of the server-side `HeartBeat` sent to the client.
pub const CLIENT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything the bridge needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub engine: EngineConfig,
    pub holocore: HolocoreConfig,
    pub reconnect: ReconnectConfig,
    /// Backend host name or address.
    pub backend_host: String,
    pub backend_port: u16,
    /// Account whose password is filled into empty login attempts.
    pub username: String,
    pub password: String,
    /// Period of the keepalive `HeartBeat` sent to a live client session.
    pub client_heartbeat_interval: Duration,
}

impl BridgeConfig {
    pub fn from_config(config: &ForwarderConfig) -> Self {
        let network = &config.network;
        let transport = &config.transport;
        Self {
            engine: EngineConfig {
                mtu: usize::from(transport.mtu),
                max_in_flight: transport.max_in_flight,
                resend_interval: transport.resend_interval(),
                session_timeout: network.session_timeout(),
            },
            holocore: HolocoreConfig {
                connect_timeout: network.connect_timeout(),
                heartbeat_interval: transport.heartbeat_interval(),
                heartbeat_timeout: transport.heartbeat_timeout(),
                ..Default::default()
            },
            reconnect: ReconnectConfig::default(),
            backend_host: network.backend_address.clone(),
            backend_port: network.backend_port,
            username: config.credentials.username.clone(),
            password: config.credentials.password.clone(),
            client_heartbeat_interval: CLIENT_HEARTBEAT_INTERVAL,
        }
    }

    fn backend_address(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_config(&ForwarderConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

struct Shared {
    engine: Mutex<SoeEngine>,
    listeners: UdpListeners,
    backend: Mutex<Option<HolocoreClient>>,
    interceptor: Mutex<NetInterceptor>,
    events: EventBus,
    /// Wakes the resend loop so it picks up a shorter timer.
    timer_reset: Notify,
    backend_requests: mpsc::UnboundedSender<()>,
    config: BridgeConfig,
}

/// A running forwarder. Dropping it stops every task without telling the
/// client or the backend; call [`Bridge::shutdown`] for an orderly exit.
pub struct Bridge {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Start forwarding between `listeners` and the configured backend.
    ///
    /// The backend is not contacted until a client asks for a session.
    pub fn start(listeners: UdpListeners, config: BridgeConfig) -> io::Result<Self> {
        let interceptor = NetInterceptor::new(
            config.username.clone(),
            config.password.clone(),
            listeners.local_port(ClientServer::Zone)?,
            listeners.local_port(ClientServer::Ping)?,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let mut tasks = listeners.spawn_receivers(datagram_tx, shutdown_rx.clone());
        let shared = Arc::new(Shared {
            engine: Mutex::new(SoeEngine::new(config.engine.clone())),
            listeners,
            backend: Mutex::new(None),
            interceptor: Mutex::new(interceptor),
            events: EventBus::new(),
            timer_reset: Notify::new(),
            backend_requests: request_tx,
            config,
        });

        tasks.push(tokio::spawn(client_loop(
            Arc::clone(&shared),
            datagram_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(resend_loop(Arc::clone(&shared), shutdown_rx.clone())));
        tasks.push(tokio::spawn(client_heartbeat_loop(
            Arc::clone(&shared),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(backend_supervisor(
            Arc::clone(&shared),
            request_rx,
            shutdown_rx,
        )));
        tracing::info!("Forwarding to backend at {}", shared.config.backend_address());

        Ok(Self {
            shared,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// Actual bound port of `server`'s listener.
    pub fn local_port(&self, server: ClientServer) -> io::Result<u16> {
        self.shared.listeners.local_port(server)
    }

    /// Credentials as last seen in a login attempt.
    pub async fn credentials(&self) -> (String, String) {
        let interceptor = self.shared.interceptor.lock().await;
        (interceptor.username().to_string(), interceptor.password().to_string())
    }

    /// Disconnect the client and the backend, stop every task, and return
    /// the credentials to persist.
    pub async fn shutdown(mut self) -> (String, String) {
        tracing::info!("Shutting down forwarder");
        let output = self.shared.engine.lock().await.shutdown();
        dispatch(&self.shared, output).await;
        if let Some(client) = self.shared.backend.lock().await.as_ref() {
            client.disconnect(ConnectionStoppedReason::Application);
        }
        let _ = self.shutdown.send(true);

        for task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Task did not stop within {SHUTDOWN_GRACE:?}");
            }
        }
        self.credentials().await
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

async fn client_loop(
    shared: Arc<Shared>,
    mut datagrams: mpsc::UnboundedReceiver<Datagram>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            datagram = datagrams.recv() => {
                let Some(datagram) = datagram else { break };
                let output = shared.engine.lock().await.handle_datagram(
                    datagram.server,
                    datagram.source,
                    &datagram.bytes,
                    Instant::now(),
                );
                dispatch(&shared, output).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Client loop stopped");
}

/// Tick the engine timer. The deadline only moves earlier when new data is
/// queued, so steady traffic cannot starve retransmission.
async fn resend_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let first = shared.engine.lock().await.next_timer_delay();
    let mut deadline = time::Instant::now() + first;
    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let output = shared.engine.lock().await.on_timer(Instant::now());
                dispatch(&shared, output).await;
                let delay = shared.engine.lock().await.next_timer_delay();
                deadline = time::Instant::now() + delay;
            }
            _ = shared.timer_reset.notified() => {
                let delay = shared.engine.lock().await.next_timer_delay();
                deadline = deadline.min(time::Instant::now() + delay);
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Resend loop stopped");
}

/// Keep the live client session warm with an empty `HeartBeat`.
async fn client_heartbeat_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = time::interval(shared.config.client_heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let output = {
                    let mut engine = shared.engine.lock().await;
                    engine.session().is_some().then(|| {
                        let mut output = engine.queue_outbound(None, HeartBeat::default().encode());
                        output.transmits.extend(engine.poll_transmit(Instant::now()));
                        output
                    })
                };
                if let Some(output) = output {
                    dispatch(&shared, output).await;
                    shared.timer_reset.notify_one();
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Client heartbeat loop stopped");
}

/// Act on one batch of engine output. Must not be called with the engine
/// locked.
async fn dispatch(shared: &Shared, output: EngineOutput) {
    let EngineOutput {
        transmits,
        deliveries,
        pings,
        events,
    } = output;

    for transmit in &transmits {
        shared.listeners.send(transmit).await;
    }

    if !deliveries.is_empty() || !pings.is_empty() {
        forward_to_backend(shared, deliveries, pings).await;
    }

    let mut session_closed = false;
    let mut opened = false;
    for event in &events {
        match *event {
            EngineEvent::SessionOpened {
                server,
                connection_id,
                source,
            } => {
                opened = true;
                shared.events.publish(BridgeEvent::SessionCreated {
                    server,
                    connection_id,
                    source,
                });
                if server == ClientServer::Login {
                    shared.events.publish(BridgeEvent::ClientConnected);
                }
            }
            EngineEvent::SessionClosed {
                server,
                connection_id,
                reason,
            } => {
                session_closed = true;
                shared.events.publish(BridgeEvent::SessionDestroyed {
                    server,
                    connection_id,
                    reason,
                });
            }
            EngineEvent::BackendConnectionRequested => {
                if shared.backend_requests.send(()).is_err() {
                    tracing::debug!("Backend supervisor gone, ignoring connection request");
                }
            }
        }
    }

    if session_closed && shared.engine.lock().await.state() == SessionState::Disconnected {
        shared.events.publish(BridgeEvent::ClientDisconnected);
        if let Some(client) = shared.backend.lock().await.as_ref() {
            client.disconnect(ConnectionStoppedReason::Application);
        }
    }

    if opened {
        shared.timer_reset.notify_one();
    }
}

async fn forward_to_backend(shared: &Shared, deliveries: Vec<Vec<u8>>, pings: Vec<Vec<u8>>) {
    let backend = shared.backend.lock().await;
    let Some(client) = backend.as_ref() else {
        tracing::debug!(
            "Backend offline, dropping {} client payloads",
            deliveries.len() + pings.len()
        );
        return;
    };

    let mut interceptor = shared.interceptor.lock().await;
    for payload in deliveries {
        if let Err(e) = client.send(interceptor.intercept_client(payload)) {
            tracing::warn!("Could not forward client payload: {e}");
            return;
        }
    }
    drop(interceptor);

    for payload in pings {
        if let Err(e) = client.send(HeartBeat { payload }.encode()) {
            tracing::warn!("Could not forward ping: {e}");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Backend side
// ---------------------------------------------------------------------------

async fn resolve_backend(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{address} did not resolve"))
    })
}

/// Connect whenever a client is waiting, then keep the connection until it
/// ends. Only one connection exists at a time.
async fn backend_supervisor(
    shared: Arc<Shared>,
    mut requests: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let address = shared.config.backend_address();
        shared.events.publish(BridgeEvent::BackendConnecting {
            address: address.clone(),
        });
        let addr = match resolve_backend(&address).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("Could not resolve backend {address}: {e}");
                backend_down(&shared, &mut requests).await;
                shared.events.publish(BridgeEvent::BackendFailed {
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let connected = connect_with_backoff(
            addr,
            &shared.config.holocore,
            shared.config.reconnect.clone(),
            &mut shutdown_rx,
        )
        .await;
        let (client, inbound) = match connected {
            Ok(connected) => connected,
            Err(ReconnectError::Cancelled) => break,
            Err(e) => {
                tracing::error!("Giving up on backend {addr}: {e}");
                backend_down(&shared, &mut requests).await;
                shared.events.publish(BridgeEvent::BackendFailed {
                    reason: e.to_string(),
                });
                continue;
            }
        };

        *shared.backend.lock().await = Some(client);
        shared.events.publish(BridgeEvent::BackendConnected { address: addr });
        let output = shared
            .engine
            .lock()
            .await
            .set_backend_connected(true, Instant::now());
        dispatch(&shared, output).await;

        pump_backend(&shared, inbound, &mut shutdown_rx).await;

        if let Some(client) = shared.backend.lock().await.take() {
            client.disconnect(ConnectionStoppedReason::OtherSideTerminated);
        }
        tracing::info!("Backend connection to {addr} ended");
        shared.events.publish(BridgeEvent::BackendDisconnected);
        backend_down(&shared, &mut requests).await;
    }
    tracing::debug!("Backend supervisor stopped");
}

/// Tell the engine the backend is gone. Requests queued before this point
/// refer to a session request the engine has just forgotten.
async fn backend_down(shared: &Shared, requests: &mut mpsc::UnboundedReceiver<()>) {
    let output = {
        let mut engine = shared.engine.lock().await;
        let output = engine.set_backend_connected(false, Instant::now());
        while requests.try_recv().is_ok() {}
        output
    };
    dispatch(shared, output).await;
}

async fn pump_backend(
    shared: &Shared,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            payload = inbound.recv() => {
                let Some(payload) = payload else { break };
                forward_to_client(shared, payload).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn forward_to_client(shared: &Shared, payload: Vec<u8>) {
    let payload = shared.interceptor.lock().await.intercept_server(payload);
    let (target, payload) = match classify(&payload) {
        Route::All => (None, payload),
        Route::Login => (Some(ClientServer::Login), payload),
        Route::Zone => (Some(ClientServer::Zone), payload),
        Route::Pong(echo) => (Some(ClientServer::Ping), echo),
    };
    let output = {
        let mut engine = shared.engine.lock().await;
        let mut output = engine.queue_outbound(target, payload);
        output.transmits.extend(engine.poll_transmit(Instant::now()));
        output
    };
    dispatch(shared, output).await;
    shared.timer_reset.notify_one();
}
