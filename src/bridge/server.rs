//! 分发器 / 服务端循环
//!
//! 接受 WebSocket 连接，逐条读取消息，路由到动作注册表并回写响应，直到断开。
//! 每条连接：分配对端 id → 推送 welcome → AwaitingMessage 循环 → Closed。
//! 处理器在派生任务上执行，慢动作（如 wait）不会阻塞后续消息的读取，
//! 因此响应可能乱序离开——调用方必须按请求 id 关联。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::browser::BrowserControl;
use super::protocol::{ActionResponse, Welcome, SENTINEL_ID};
use super::registry::ActionRegistry;
use crate::error::Error;

/// 已连接对端
struct Peer {
    tx: mpsc::UnboundedSender<String>,
}

/// 桥接分发服务器
pub struct BridgeServer {
    browser: Arc<dyn BrowserControl>,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl BridgeServer {
    pub fn new(browser: Arc<dyn BrowserControl>) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            browser,
            peers: Arc::new(RwLock::new(HashMap::new())),
            shutdown: shutdown_tx,
        }
    }

    /// 绑定并启动接收循环，返回实际监听地址（便于用 0 端口测试）
    pub async fn start(&self, bind_addr: &str) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Connection(e.to_string()))?;

        tracing::info!("Bridge dispatcher listening on ws://{}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        let peers = Arc::clone(&self.peers);
        let browser = Arc::clone(&self.browser);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let peers = Arc::clone(&peers);
                                let browser = Arc::clone(&browser);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_peer(stream, addr, peers, browser).await {
                                        tracing::warn!("Peer {} ended with error: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// 停止接收新连接并清空对端表
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.peers.write().await.clear();
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

fn generate_request_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}_{}", &suffix[..8], chrono::Utc::now().timestamp())
}

async fn handle_peer(
    stream: TcpStream,
    addr: SocketAddr,
    peers: Arc<RwLock<HashMap<String, Peer>>>,
    browser: Arc<dyn BrowserControl>,
) -> Result<(), Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::Connection(format!("WebSocket handshake failed: {}", e)))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let peer_id = {
        let mut peers = peers.write().await;
        // 序号 + 时间戳会在同秒重连时撞号，uuid 后缀保证唯一
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("client_{}", &suffix[..12]);
        peers.insert(id.clone(), Peer { tx: tx.clone() });
        id
    };
    tracing::info!("Peer {} connected from {}", peer_id, addr);

    // 写泵：统一经 mpsc 序列化出站帧
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let welcome = Welcome::new(&peer_id);
    let _ = tx.send(serde_json::to_string(&welcome).unwrap_or_default());

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error from {}: {}", peer_id, e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => {
                        let resp = ActionResponse::err(SENTINEL_ID, "Invalid JSON message");
                        let _ = tx.send(serde_json::to_string(&resp).unwrap_or_default());
                        continue;
                    }
                };

                let request_id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(generate_request_id);

                let (action, params) = match value.as_object() {
                    Some(obj) => (
                        obj.get("action")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        obj.clone(),
                    ),
                    None => {
                        let resp = ActionResponse::err(&request_id, "Invalid JSON message");
                        let _ = tx.send(serde_json::to_string(&resp).unwrap_or_default());
                        continue;
                    }
                };

                tracing::info!("Received action: {} from {}", action, peer_id);

                // 处理器可能挂起（如 wait），派生执行避免堵塞读循环
                let browser = Arc::clone(&browser);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let envelope = ActionRegistry::dispatch(&action, &params, browser.as_ref()).await;
                    if envelope.success {
                        tracing::info!("Action {} completed", action);
                    } else {
                        tracing::warn!(
                            "Action {} failed: {}",
                            action,
                            envelope.error.as_deref().unwrap_or("")
                        );
                    }
                    let resp = ActionResponse {
                        id: request_id,
                        result: envelope,
                    };
                    let _ = tx.send(serde_json::to_string(&resp).unwrap_or_default());
                });
            }

            WsMessage::Close(_) => break,

            _ => {}
        }
    }

    peers.write().await.remove(&peer_id);
    tracing::info!("Peer {} disconnected", peer_id);
    Ok(())
}
