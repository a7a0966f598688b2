// ActionServer: websocket acceptor, per-connection action dispatch and broadcast
//
// Knows nothing about jobs. Actions are registered as typed entries (name,
// required keys, defaults, handler). Every connection runs its own loop that
// forwards the shared broadcast channel and the replies of its requests, which
// are handled in tasks of their own.

use crate::supervisor::protocol::{
    serialize_message, ActionResponse, ServerMessage, INVALID_ACTION, MAX_REQUEST_FRAME_SIZE,
};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered per client before a slow client starts skipping
const BROADCAST_CAPACITY: usize = 1024;

pub type ClientId = u64;

pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResponse> + Send>>;

type ActionHandler = Arc<dyn Fn(Vec<Value>) -> ActionFuture + Send + Sync>;

/// One entry of the action table
#[derive(Clone)]
pub struct Action {
    name: String,
    keys: Vec<String>,
    defaults: Map<String, Value>,
    handler: ActionHandler,
}

impl Action {
    /// `handler` receives the values of `keys`, in order
    pub fn new<F, Fut>(name: &str, keys: &[&str], handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResponse> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            keys: keys.iter().map(|key| key.to_string()).collect(),
            defaults: Map::new(),
            handler: Arc::new(move |values| Box::pin(handler(values))),
        }
    }

    /// Optional key: appended to the handler's values, `value` when absent
    pub fn with_default(mut self, key: &str, value: Value) -> Self {
        if !self.keys.iter().any(|k| k == key) {
            self.keys.push(key.to_string());
        }
        self.defaults.insert(key.to_string(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Values for every key, or the keys neither `data` nor the defaults provide
    fn extract(&self, data: &Map<String, Value>) -> Result<Vec<Value>, Vec<String>> {
        let mut values = Vec::with_capacity(self.keys.len());
        let mut missing = Vec::new();

        for key in &self.keys {
            match data.get(key).or_else(|| self.defaults.get(key)) {
                Some(value) => values.push(value.clone()),
                None => missing.push(key.clone()),
            }
        }

        if missing.is_empty() {
            Ok(values)
        } else {
            Err(missing)
        }
    }

    pub async fn call(&self, data: &Map<String, Value>) -> ActionResponse {
        match self.extract(data) {
            Ok(values) => {
                let response = (self.handler)(values).await;
                debug!(action = %self.name, success = response.success, "Action handled");
                response
            }
            Err(missing) => ActionResponse::failure(
                request_uid(data),
                self.name.as_str(),
                format!("missing required keys: {}", missing.join(", ")),
            ),
        }
    }
}

/// Frames unicast to a client right after it connects
#[async_trait]
pub trait WelcomeHook: Send + Sync {
    async fn welcome(&self) -> Vec<ServerMessage>;
}

pub struct ActionServer {
    actions: RwLock<HashMap<String, Action>>,
    clients: Mutex<HashMap<ClientId, SocketAddr>>,
    next_client_id: AtomicU64,
    welcome: RwLock<Option<Arc<dyn WelcomeHook>>>,
    updates_tx: broadcast::Sender<String>,
    cancel: CancellationToken,
}

impl Default for ActionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionServer {
    pub fn new() -> Self {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    /// Server whose clients may fall `capacity` broadcast frames behind
    pub fn with_capacity(capacity: usize) -> Self {
        let (updates_tx, _) = broadcast::channel(capacity);
        Self {
            actions: RwLock::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            welcome: RwLock::new(None),
            updates_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Register an action; false if the name is taken
    pub fn add_action(&self, action: Action) -> bool {
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        if actions.contains_key(action.name()) {
            return false;
        }
        actions.insert(action.name().to_string(), action);
        true
    }

    pub fn set_welcome_hook(&self, hook: Arc<dyn WelcomeHook>) {
        *self.welcome.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn client_addrs(&self) -> Vec<SocketAddr> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .collect()
    }

    /// Send one frame to every connected client
    ///
    /// Never blocks and never fails: with no clients the frame is dropped.
    pub fn broadcast(&self, message: &ServerMessage) {
        match serialize_message(message) {
            Ok(frame) => {
                let _ = self.updates_tx.send(frame);
            }
            Err(err) => warn!("Failed to serialize broadcast frame: {}", err),
        }
    }

    /// Parse one request frame and run the matching action
    pub async fn handle_request(&self, text: &str) -> ActionResponse {
        if text.len() > MAX_REQUEST_FRAME_SIZE {
            return ActionResponse::failure(
                None,
                INVALID_ACTION,
                format!(
                    "Request frame of {} bytes exceeds limit of {} bytes",
                    text.len(),
                    MAX_REQUEST_FRAME_SIZE
                ),
            );
        }

        let request: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                return ActionResponse::failure(
                    None,
                    INVALID_ACTION,
                    format!("Received invalid input: {}", text),
                )
            }
        };

        let Some(name) = request.get("action").and_then(Value::as_str) else {
            return ActionResponse::failure(None, INVALID_ACTION, "Request has no action name");
        };

        let data = match request.get("data") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(_) => {
                return ActionResponse::failure(None, name, "Action data must be an object");
            }
        };

        let action = self
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match action {
            Some(action) => action.call(&data).await,
            None => ActionResponse::failure(
                request_uid(&data),
                name,
                format!("Unknown action '{}'", name),
            ),
        }
    }

    /// Accept connections until `shutdown` is called
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "Action server listening"),
            Err(err) => debug!("Listener has no local address: {}", err),
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Action server stopped accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, addr).await;
                        });
                    }
                    Err(err) => warn!("Accept error: {}", err),
                }
            }
        }

        Ok(())
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(%addr, "Websocket handshake failed: {}", err);
                return;
            }
        };

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, addr);
        info!(client_id, %addr, "Client added");

        if let Err(err) = self.client_loop(ws).await {
            info!(client_id, "Websocket connection error: {:#}", err);
        }

        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id);
        info!(client_id, %addr, "Client removed");
    }

    /// Frames produced by the welcome hook, if one is set
    async fn welcome_frames(&self) -> Result<Vec<Message>> {
        let hook = self
            .welcome
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(hook) = hook else {
            return Ok(Vec::new());
        };
        hook.welcome().await.iter().map(text_frame).collect()
    }

    /// Forward broadcasts and action replies to one client
    ///
    /// Each request runs in its own task and replies through `replies_tx`, so
    /// broadcasts keep flowing while a slow action (a stop escalation) is in
    /// flight.
    async fn client_loop(self: &Arc<Self>, ws: WebSocketStream<TcpStream>) -> Result<()> {
        let (mut sink, mut stream) = ws.split();
        // Subscribe before the welcome so nothing broadcast in between is lost
        let mut updates_rx = self.updates_tx.subscribe();
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<ActionResponse>();

        for frame in self.welcome_frames().await? {
            sink.send(frame).await?;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                incoming = stream.next() => {
                    let Some(incoming) = incoming else {
                        break;
                    };
                    match incoming? {
                        Message::Text(text) => {
                            let server = Arc::clone(self);
                            let replies_tx = replies_tx.clone();
                            tokio::spawn(async move {
                                let response = server.handle_request(text.as_str()).await;
                                // The client may be gone by the time a long action finishes
                                let _ = replies_tx.send(response);
                            });
                        }
                        Message::Binary(_) => {
                            let response = ActionResponse::failure(
                                None,
                                INVALID_ACTION,
                                "Binary frames are not supported",
                            );
                            sink.send(text_frame(&ServerMessage::ActionResponse(response))?).await?;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                Some(response) = replies_rx.recv() => {
                    sink.send(text_frame(&ServerMessage::ActionResponse(response))?).await?;
                }

                update = updates_rx.recv() => match update {
                    Ok(frame) => sink.send(Message::Text(frame.into())).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Client is lagging, resending the welcome snapshot");
                        for frame in self.welcome_frames().await? {
                            sink.send(frame).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

fn text_frame(message: &ServerMessage) -> Result<Message> {
    Ok(Message::Text(serialize_message(message)?.into()))
}

/// The request's `uid`, echoed on failures for client-side correlation
fn request_uid(data: &Map<String, Value>) -> Option<String> {
    data.get("uid").and_then(Value::as_str).map(str::to_string)
}
