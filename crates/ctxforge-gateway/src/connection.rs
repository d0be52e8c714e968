use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::AppState;

/// Stream one progress channel to a WebSocket client as JSON text frames.
///
/// A channel that already finished is answered with a single `snapshot`
/// frame holding the stored terminal state.
pub async fn handle_channel(ws: WebSocket, channel: String, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Subscribe before checking the store so a run finishing in between is not lost
    let mut events = state.event_bus.subscribe_channel(&channel);

    if let Some(snapshot) = terminal_snapshot(&state, &channel).await {
        drop(events);
        state.event_bus.release_channel(&channel);
        let _ = ws_tx.send(Message::Text(snapshot.to_string().into())).await;
        let _ = ws_tx.close().await;
        debug!(channel = %channel, "Sent terminal snapshot");
        return;
    }

    loop {
        tokio::select! {
            result = events.recv() => match result {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    match serde_json::to_string(&event) {
                        Ok(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(channel = %channel, error = %e, "Failed to encode event"),
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(channel = %channel, skipped = n, "WebSocket subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            _ = state.shutdown.cancelled() => break,
        }
    }

    drop(events);
    state.event_bus.release_channel(&channel);
    let _ = ws_tx.close().await;
}

async fn terminal_snapshot(state: &AppState, channel: &str) -> Option<serde_json::Value> {
    if let Ok(Some(session)) = state.store.load_session(channel).await {
        return Some(json!({ "channel": channel, "type": "snapshot", "data": session }));
    }
    if let Ok(Some(run)) = state.store.load_comparison(channel).await {
        return Some(json!({ "channel": channel, "type": "snapshot", "data": run }));
    }
    None
}
