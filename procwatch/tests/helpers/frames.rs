use procwatch::supervisor::client::ActionClient;
use procwatch::supervisor::protocol::ServerMessage;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Next frame, panicking if none arrives in time or the connection closes
pub async fn next_frame(client: &mut ActionClient, within: Duration) -> ServerMessage {
    match timeout(within, client.next_message()).await {
        Ok(Ok(Some(message))) => message,
        Ok(Ok(None)) => panic!("connection closed while waiting for a frame"),
        Ok(Err(err)) => panic!("failed to read frame: {:#}", err),
        Err(_) => panic!("no frame within {:?}", within),
    }
}

/// Skip frames until one matches `pred`
pub async fn wait_for_frame<F>(
    client: &mut ActionClient,
    within: Duration,
    desc: &str,
    mut pred: F,
) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = match timeout(remaining, client.next_message()).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => panic!("connection closed while waiting for {}", desc),
            Ok(Err(err)) => panic!("failed to read frame while waiting for {}: {:#}", desc, err),
            Err(_) => panic!("Timeout waiting for {} after {:?}", desc, within),
        };
        if pred(&message) {
            return message;
        }
    }
}

/// Every frame received during `window`
pub async fn collect_for(client: &mut ActionClient, window: Duration) -> Vec<ServerMessage> {
    let deadline = Instant::now() + window;
    let mut frames = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, client.next_message()).await {
            Ok(Ok(Some(message))) => frames.push(message),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => return frames,
        }
    }
}
