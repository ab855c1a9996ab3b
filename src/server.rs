use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Serialize;

use crate::hub::LiveHub;
use crate::runtime::BackendRuntime;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(hub: Arc<LiveHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_route))
        .with_state(hub)
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime.config.bind_addr()?;
    let scheduler = runtime.spawn_scheduler();
    let app = router(runtime.hub.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Critique backend listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Backend server failed")?;

    scheduler.abort();
    tracing::info!("Critique backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn ws_route(State(hub): State<Arc<LiveHub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_socket(hub, socket))
}

async fn handle_control_socket(hub: Arc<LiveHub>, mut socket: WebSocket) {
    let session = hub.connect();
    hub.activate(session.id);

    loop {
        tokio::select! {
            outgoing = session.outbound.recv_async() => {
                match outgoing {
                    Ok(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    // hub dropped this session
                    Err(_) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        hub.handle_message(session.id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("Session {} socket error: {}", session.id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.close(session.id);
}
