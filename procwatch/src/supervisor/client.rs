// Action client for the CLI and tests
// Talks to the daemon over its websocket; broadcast frames that arrive while
// waiting for a reply are skipped.

use super::protocol::{
    deserialize_message, serialize_message, ActionRequest, ActionResponse, ServerMessage,
};
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// How long `connect_with_retry` keeps trying
const CONNECT_RETRY_WINDOW: Duration = Duration::from_secs(2);

pub struct ActionClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ActionClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", url))?;
        Ok(Self { ws })
    }

    /// Connect, retrying while a freshly started daemon binds its port
    pub async fn connect_with_retry(url: &str) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + CONNECT_RETRY_WINDOW;
        loop {
            match Self::connect(url).await {
                Ok(client) => return Ok(client),
                Err(err) if tokio::time::Instant::now() >= deadline => return Err(err),
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    /// Send a raw text frame without waiting for a reply
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .context("Failed to send frame to daemon")
    }

    /// Send one action and wait for its `ActionResponse`
    pub async fn send_action(&mut self, action: &str, data: Map<String, Value>) -> Result<ActionResponse> {
        let request = ActionRequest::new(action, data);
        self.send_text(serialize_message(&request)?)
            .await
            .with_context(|| format!("Failed to send '{}' request", action))?;
        self.wait_for_response(action).await
    }

    /// Skip broadcast frames until the next `ActionResponse`
    pub async fn wait_for_response(&mut self, action: &str) -> Result<ActionResponse> {
        loop {
            match self.next_message().await? {
                Some(ServerMessage::ActionResponse(response)) => return Ok(response),
                Some(_) => debug!("Skipping broadcast frame while waiting for response"),
                None => bail!("Connection closed before a response to '{}' arrived", action),
            }
        }
    }

    /// Next frame from the server, `None` once the connection is closed
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(frame) = self.ws.next().await {
            match frame.context("Failed to read from daemon")? {
                Message::Text(text) => {
                    let message = deserialize_message(text.as_str())
                        .with_context(|| format!("Invalid frame from daemon: {}", text.as_str()))?;
                    return Ok(Some(message));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await.context("Failed to close connection")
    }
}

/// Connect, issue a single action and disconnect
pub async fn run_single_action(url: &str, action: &str, data: Map<String, Value>) -> Result<ActionResponse> {
    let mut client = ActionClient::connect(url).await?;
    let response = client.send_action(action, data).await?;
    if let Err(err) = client.close().await {
        debug!("Close after single action failed: {:#}", err);
    }
    Ok(response)
}
