use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::Engine;
use facerelay_protocol::{CaptureResult, ObserverCommand, RelayEvent};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Optional device scope for an observer
#[derive(Debug, Default, Deserialize)]
pub struct ObserverQuery {
    pub device_id: Option<String>,
    pub secret: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ObserverQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let scope = match (query.device_id, query.secret) {
        (Some(device_id), Some(secret)) => {
            state.authenticator.authenticate(&device_id, &secret).await?;
            Some(device_id)
        }
        (None, None) => None,
        _ => return Err(AppError::Unauthorized),
    };

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, scope)))
}

async fn handle_socket(socket: WebSocket, state: AppState, scope: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Outbound events are queued here by the hub
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let observer_id = state.hub.subscribe(tx, scope.clone()).await;

    tracing::info!(
        "Observer {} connected (device: {})",
        observer_id,
        scope.as_deref().unwrap_or("<all>")
    );

    state.hub.send_to(observer_id, &RelayEvent::Connected).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ObserverCommand>(&text) {
                Ok(command) => handle_command(&state, observer_id, command).await,
                Err(e) => {
                    tracing::debug!("Ignoring malformed message from {}: {}", observer_id, e);
                }
            },
            Ok(Message::Ping(_)) => {
                state.hub.send_to(observer_id, &RelayEvent::Pong).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket error for observer {}: {}", observer_id, e);
                break;
            }
        }
    }

    state.hub.unsubscribe(observer_id).await;
    send_task.abort();

    tracing::info!("Observer {} disconnected", observer_id);
}

async fn handle_command(state: &AppState, observer_id: Uuid, command: ObserverCommand) {
    match command {
        ObserverCommand::Ping => {
            state.hub.send_to(observer_id, &RelayEvent::Pong).await;
        }
        ObserverCommand::Capture {
            device_id,
            frame_index,
        } => {
            // Waiting for a frame can take a while; keep reading commands meanwhile
            let state = state.clone();
            tokio::spawn(async move {
                let data = match state.manager.capture_once(&device_id).await {
                    Ok(jpeg) => CaptureResult::captured(
                        device_id,
                        frame_index,
                        base64::engine::general_purpose::STANDARD.encode(jpeg),
                    ),
                    Err(e) => {
                        tracing::debug!("Capture from {} failed: {}", device_id, e);
                        CaptureResult::failed(device_id, frame_index, e.to_string())
                    }
                };
                state
                    .hub
                    .send_to(observer_id, &RelayEvent::CaptureResult { data })
                    .await;
            });
        }
        ObserverCommand::RefreshEndpoint { device_id } => {
            match state.manager.refresh_endpoint(&device_id).await {
                Some(endpoint) => {
                    tracing::debug!("Endpoint for {} refreshed: {}", device_id, endpoint)
                }
                None => tracing::debug!("Endpoint refresh for {} ignored: not capturing", device_id),
            }
        }
    }
}
