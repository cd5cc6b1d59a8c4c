//! WebSocket Race Server
//!
//! Async WebSocket front end for the race engine.
//! Handles registration, matchmaking, keystroke routing and event fan-out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::network::protocol::{
    server_time_ms, ClientMessage, ErrorCode, KeyInput, ServerError, ServerMessage,
};
use crate::race::manager::env_or;
use crate::race::{
    EventReceiver, Manager, ManagerConfig, ManagerError, PlayerId, PracticeRun, ProgressOutcome,
    PromptSource, RaceEvent,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time a new connection has to send its hello.
    pub hello_timeout: Duration,
    /// Interval between reaper passes.
    pub reap_interval: Duration,
    /// Server version string.
    pub version: String,
    /// Race engine configuration.
    pub manager: ManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            hello_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(15),
            version: env!("CARGO_PKG_VERSION").to_string(),
            manager: ManagerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("TYPERACE_BIND", defaults.bind_addr),
            max_connections: env_or("TYPERACE_MAX_CONNECTIONS", defaults.max_connections),
            manager: ManagerConfig::from_env(),
            ..defaults
        }
    }
}

/// Race server errors.
#[derive(Debug, thiserror::Error)]
pub enum RaceServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Client never identified itself.
    #[error("No hello within {0:?}")]
    HelloTimeout(Duration),

    /// Engine rejected an operation.
    #[error("Race error: {0}")]
    Manager(#[from] ManagerError),
}

/// Connected client state.
struct ConnectedClient {
    /// Player identifier (after hello).
    player_id: Option<PlayerId>,
    /// Connection time.
    connected_at: Instant,
}

type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// The race server.
pub struct RaceServer {
    /// Server configuration.
    config: ServerConfig,
    /// Race engine.
    manager: Arc<Manager>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl RaceServer {
    /// Create a new race server.
    pub fn new(config: ServerConfig, prompts: Arc<dyn PromptSource>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = Arc::new(Manager::new(config.manager.clone(), prompts));

        Self {
            config,
            manager,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Race engine behind this server.
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), RaceServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RaceServerError> {
        info!("Race server listening on {}", listener.local_addr()?);

        let reaper_manager = self.manager.clone();
        let reap_interval = self.config.reap_interval;
        let reaper_handle = tokio::spawn(async move {
            Self::run_reaper_loop(reaper_manager, reap_interval).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        reaper_handle.abort();

        Ok(())
    }

    /// Register a new connection and spawn its task.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let manager = self.manager.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        clients.write().await.insert(
            addr,
            ConnectedClient {
                player_id: None,
                connected_at: Instant::now(),
            },
        );

        tokio::spawn(async move {
            if let Err(e) =
                Self::serve_client(stream, addr, &clients, &manager, &config, shutdown_rx).await
            {
                debug!("Connection {} ended: {}", addr, e);
            }

            // Cleanup
            if let Some(client) = clients.write().await.remove(&addr) {
                if let Some(player_id) = client.player_id {
                    manager.remove_player(&player_id).await;
                }
                info!(
                    "Client {} cleaned up after {:?}",
                    addr,
                    client.connected_at.elapsed()
                );
            }
        });
    }

    /// Drive one client from handshake to disconnect.
    async fn serve_client(
        stream: TcpStream,
        addr: SocketAddr,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
        manager: &Arc<Manager>,
        config: &ServerConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), RaceServerError> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

        // Spawn message sender task
        let sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let registered =
            Self::register(addr, &mut ws_receiver, clients, manager, config, &msg_tx).await;
        let result = match registered {
            Ok(player_id) => {
                let _ = msg_tx
                    .send(ServerMessage::Welcome {
                        player_id: player_id.clone(),
                        server_version: config.version.clone(),
                    })
                    .await;

                Self::race_loop(&player_id, &mut ws_receiver, manager, &msg_tx, &mut shutdown_rx)
                    .await
            }
            Err(e) => Err(e),
        };

        // Let queued messages (errors, shutdown) flush before closing.
        drop(msg_tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;

        result
    }

    /// Wait for the hello and register the player.
    async fn register(
        addr: SocketAddr,
        ws_receiver: &mut WsReceiver,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
        manager: &Arc<Manager>,
        config: &ServerConfig,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Result<PlayerId, RaceServerError> {
        let hello =
            tokio::time::timeout(config.hello_timeout, Self::read_hello(addr, ws_receiver, sender))
                .await;

        let (raw_id, name) = match hello {
            Ok(Ok(Some(hello))) => hello,
            Ok(Ok(None)) => return Err(RaceServerError::WebSocket(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            )),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                Self::send_error(sender, ErrorCode::Timeout, "No hello received").await;
                return Err(RaceServerError::HelloTimeout(config.hello_timeout));
            }
        };

        let player_id = PlayerId::new(raw_id);
        if let Err(e) = manager.add_player(player_id.clone(), name).await {
            let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            return Err(e.into());
        }

        if let Some(client) = clients.write().await.get_mut(&addr) {
            client.player_id = Some(player_id.clone());
        }

        debug!("Client {} registered as {}", addr, player_id);
        Ok(player_id)
    }

    /// Read messages until a hello arrives. `None` if the socket closed first.
    async fn read_hello(
        addr: SocketAddr,
        ws_receiver: &mut WsReceiver,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Result<Option<(String, String)>, RaceServerError> {
        while let Some(msg) = ws_receiver.next().await {
            match msg? {
                Message::Text(text) => match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::Hello { player_id, name }) => {
                        return Ok(Some((player_id, name)));
                    }
                    Ok(_) => {
                        Self::send_error(sender, ErrorCode::NotRegistered, "Send hello first")
                            .await;
                    }
                    Err(e) => {
                        debug!("Invalid message from {}: {}", addr, e);
                        Self::send_error(sender, ErrorCode::InvalidInput, "Invalid message format")
                            .await;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(None)
    }

    /// Matchmake, then pump client messages and race events until the client
    /// leaves or the server shuts down.
    async fn race_loop(
        player_id: &PlayerId,
        ws_receiver: &mut WsReceiver,
        manager: &Arc<Manager>,
        sender: &mpsc::Sender<ServerMessage>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), RaceServerError> {
        let mut events = Self::enter_matchmaking(player_id, manager, sender).await;
        let mut typed = String::new();
        let mut practice: Option<PracticeRun> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let client_msg = match msg {
                        Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", player_id, e);
                                let reason = "Invalid message format";
                                Self::send_error(sender, ErrorCode::InvalidInput, reason).await;
                                continue;
                            }
                        },
                        Some(Ok(Message::Binary(data))) => match KeyInput::from_bytes(&data) {
                            Ok(key) => ClientMessage::Key(key),
                            Err(e) => {
                                debug!("Invalid key frame from {}: {}", player_id, e);
                                let reason = "Invalid key frame";
                                Self::send_error(sender, ErrorCode::InvalidInput, reason).await;
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", player_id);
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    match client_msg {
                        ClientMessage::Key(key) => {
                            let mut candidate = typed.clone();
                            if !key.apply(&mut candidate) {
                                let reason = "Invalid key";
                                Self::send_error(sender, ErrorCode::InvalidInput, reason).await;
                                continue;
                            }
                            let run = practice.as_mut();
                            if Self::route(player_id, &candidate, manager, run, sender).await {
                                typed = candidate;
                            }
                        }
                        ClientMessage::Typed { text } => {
                            let run = practice.as_mut();
                            if Self::route(player_id, &text, manager, run, sender).await {
                                typed = text;
                            }
                        }
                        ClientMessage::Practice => {
                            typed.clear();
                            match practice.as_mut() {
                                Some(run) => run.restart(manager.fetch_prompt().await, Utc::now()),
                                None => match manager.start_practice(player_id).await {
                                    Ok(run) => {
                                        // Solo runs have no group feed.
                                        events = None;
                                        practice = Some(run);
                                    }
                                    Err(e) => {
                                        let error = ServerError::from(&e);
                                        let _ = sender.send(ServerMessage::Error(error)).await;
                                        continue;
                                    }
                                },
                            }
                            Self::send_practice(practice.as_ref(), sender).await;
                        }
                        ClientMessage::Requeue => {
                            manager.detach_player(player_id).await?;
                            typed.clear();
                            practice = None;
                            events = Self::enter_matchmaking(player_id, manager, sender).await;
                        }
                        ClientMessage::SyncRequest => {
                            if practice.is_some() {
                                Self::send_practice(practice.as_ref(), sender).await;
                            } else {
                                Self::send_snapshot(player_id, manager, sender).await;
                            }
                        }
                        ClientMessage::Ping { timestamp } => {
                            let _ = sender.send(ServerMessage::Pong {
                                timestamp,
                                server_time: server_time_ms(),
                            }).await;
                        }
                        ClientMessage::Hello { .. } => {
                            let reason = "Already registered";
                            Self::send_error(sender, ErrorCode::AlreadyRegistered, reason).await;
                        }
                        ClientMessage::Leave => {
                            debug!("Client {} left", player_id);
                            return Ok(());
                        }
                    }
                }
                event = next_event(&mut events) => {
                    match event {
                        Ok(event) => {
                            let dropped = matches!(event, RaceEvent::Abandoned | RaceEvent::Closed);
                            let _ = sender.send(ServerMessage::Event(event)).await;
                            if dropped {
                                events = None;
                                Self::send_snapshot(player_id, manager, sender).await;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Client {} lagged {} events, resyncing", player_id, skipped);
                            Self::send_snapshot(player_id, manager, sender).await;
                        }
                        Err(RecvError::Closed) => {
                            // Group dropped without a final event; show where the player stands.
                            events = None;
                            Self::send_snapshot(player_id, manager, sender).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = sender.send(ServerMessage::Shutdown {
                        reason: "Server shutting down".to_string(),
                    }).await;
                    return Ok(());
                }
            }
        }
    }

    /// Seat the player, subscribe to its group and send the opening snapshot.
    async fn enter_matchmaking(
        player_id: &PlayerId,
        manager: &Arc<Manager>,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Option<EventReceiver> {
        if let Err(e) = manager.matchmake(player_id).await {
            warn!("Matchmaking failed for {}: {}", player_id, e);
            let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            return None;
        }

        // Subscribe before the snapshot so nothing falls between them.
        let events = manager.subscribe(player_id).await.ok();
        Self::send_snapshot(player_id, manager, sender).await;
        events
    }

    /// Forward typed text to the practice run or the engine. Returns true if
    /// it was accepted.
    async fn route(
        player_id: &PlayerId,
        text: &str,
        manager: &Arc<Manager>,
        practice: Option<&mut PracticeRun>,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> bool {
        if let Some(run) = practice {
            let outcome = run.apply_typed(text, Utc::now());
            if outcome == ProgressOutcome::Ignored {
                return false;
            }
            let _ = sender.send(ServerMessage::Practice(run.snapshot(Utc::now()))).await;
            return true;
        }

        match manager.route_progress(player_id, text).await {
            Ok(_) => true,
            Err(e) => {
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
                false
            }
        }
    }

    async fn send_snapshot(
        player_id: &PlayerId,
        manager: &Arc<Manager>,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match manager.player_view(player_id).await {
            Ok(view) => {
                let _ = sender.send(ServerMessage::Snapshot(view)).await;
            }
            Err(e) => {
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            }
        }
    }

    async fn send_practice(run: Option<&PracticeRun>, sender: &mpsc::Sender<ServerMessage>) {
        if let Some(run) = run {
            let _ = sender.send(ServerMessage::Practice(run.snapshot(Utc::now()))).await;
        }
    }

    async fn send_error(sender: &mpsc::Sender<ServerMessage>, code: ErrorCode, message: &str) {
        let _ = sender
            .send(ServerMessage::Error(ServerError::new(code, message)))
            .await;
    }

    /// Run reaper loop.
    async fn run_reaper_loop(manager: Arc<Manager>, period: Duration) {
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            let removed = manager.reap(Utc::now()).await;
            if removed > 0 {
                let status = manager.status().await;
                info!(
                    "Reaped {} sessions ({} players, {} lobbies, {} sessions remain)",
                    removed, status.total_players, status.active_lobbies, status.active_sessions
                );
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.manager.status().await.active_sessions
    }
}

/// Next event from an optional feed; pends forever without one.
async fn next_event(events: &mut Option<EventReceiver>) -> Result<RaceEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
