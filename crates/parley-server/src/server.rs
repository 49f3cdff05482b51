//! HTTP Server - 提供健康检查和 WebSocket 接入点
//!
//! The WebSocket endpoint speaks the STOMP-subset protocol implemented
//! by `parley-broker`; everything transport-level lives here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parley_broker::Outbound;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// 运行 HTTP 服务器
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address: {}", e))?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Parley server starting on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// 创建路由
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        // 健康检查
        .route("/health", get(health_handler))
        // WebSocket
        .route("/ws", get(websocket_handler))
        // 中间件
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 健康检查处理器
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "connections": state.broker.connection_count().await,
        "channels": state.broker.channel_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// WebSocket 处理器
async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // 每个连接一个出站队列，由发送任务独占 socket sink
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = state.broker.connect(outbound_tx).await;

    // 发送任务: 将代理产生的帧写入 WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(wire) => {
                    if sink.send(Message::Text(wire)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // 接收循环: 按到达顺序逐帧交给代理处理
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                state.broker.handle_frame(connection_id, &text).await;
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(connection = connection_id, "client closed websocket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = connection_id, error = %e, "websocket error");
                break;
            }
        }
    }

    // 清理订阅并注销连接
    state.broker.disconnect(connection_id).await;
    send_task.abort();
}
