//! 传输会话
//!
//! 到单个对端的长连接：发送一条完整 JSON 文本帧、接收一条文本帧，检测断开。
//! 帧即消息——底层 WebSocket 保留消息边界，无需拆帧重组。
//! 健康检查：定期 Ping，并记录最近一次收到任何帧（含 Pong）的时刻；
//! 写失败、或超过两个心跳周期没有任何入站帧（半开连接），都视为断开，
//! 翻转连接标志并关闭入站通道。

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Error, Result};

/// 对端传输：发送文本帧 / 关闭 / 连接标志
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, text: String) -> Result<()>;
    async fn close(&self);
    fn is_connected(&self) -> bool;
}

enum Outbound {
    Frame(String),
    Close,
}

/// WebSocket 客户端传输
pub struct WsTransport {
    out_tx: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// 连接对端，返回传输端与入站帧接收器
    pub async fn connect(
        url: &str,
        keepalive_secs: u64,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<String>)> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect {}: {}", url, e)))?;

        tracing::info!("Connected to bridge peer at {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let connected = Arc::new(AtomicBool::new(true));
        let last_inbound = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));
        // 写泵退出时通知读泵收尾，入站通道随之关闭
        let (closed_tx, mut closed_rx) = tokio::sync::watch::channel(false);

        // 写泵 + keepalive：定期 Ping，入站静默超过两个心跳周期按断开处理
        let connected_w = Arc::clone(&connected);
        let last_inbound_w = Arc::clone(&last_inbound);
        let keepalive_ms = keepalive_secs.max(1) as i64 * 1000;
        tokio::spawn(async move {
            let mut keepalive =
                tokio::time::interval(std::time::Duration::from_secs(keepalive_secs.max(1)));
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    cmd = out_rx.recv() => {
                        match cmd {
                            Some(Outbound::Frame(text)) => {
                                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Outbound::Close) | None => {
                                let _ = ws_tx.send(WsMessage::Close(None)).await;
                                break;
                            }
                        }
                    }
                    _ = keepalive.tick() => {
                        let idle_ms = chrono::Utc::now().timestamp_millis()
                            - last_inbound_w.load(Ordering::SeqCst);
                        if idle_ms > 2 * keepalive_ms {
                            tracing::warn!(
                                "Bridge peer silent for {}ms, treating as disconnected",
                                idle_ms
                            );
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                        if ws_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            connected_w.store(false, Ordering::SeqCst);
            let _ = closed_tx.send(true);
        });

        // 读泵：文本帧进入入站通道；任何入站帧（含 Pong）都刷新活性时刻
        let connected_r = Arc::clone(&connected);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                last_inbound.store(
                                    chrono::Utc::now().timestamp_millis(),
                                    Ordering::SeqCst,
                                );
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {
                                last_inbound.store(
                                    chrono::Utc::now().timestamp_millis(),
                                    Ordering::SeqCst,
                                );
                            }
                        }
                    }
                    _ = closed_rx.changed() => {
                        if *closed_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            connected_r.store(false, Ordering::SeqCst);
        });

        Ok((
            Arc::new(Self {
                out_tx,
                connected,
            }),
            in_rx,
        ))
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection("Not connected to bridge peer".to_string()));
        }
        self.out_tx
            .send(Outbound::Frame(text))
            .map_err(|_| Error::Connection("Connection closed".to_string()))
    }

    async fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// 通道传输：脱离网络测试关联与工作流时使用
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

/// 假对端手柄：读取客户端发出的帧、注入入站帧
pub struct FakePeer {
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// 返回（传输端, 客户端入站接收器, 对端手柄）
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>, FakePeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: out_tx,
                connected: Arc::new(AtomicBool::new(true)),
            }),
            in_rx,
            FakePeer {
                outbound_rx: out_rx,
                inbound_tx: in_tx,
            },
        )
    }
}

#[async_trait]
impl PeerTransport for ChannelTransport {
    async fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Connection("Not connected".to_string()));
        }
        self.tx
            .send(text)
            .map_err(|_| Error::Connection("Peer dropped".to_string()))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_silent_peer_detected_as_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 完成握手后既不读也不写的对端（半开连接）
        let silent_peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(ws);
        });

        let (transport, mut inbound) =
            WsTransport::connect(&format!("ws://{}", addr), 1).await.unwrap();
        assert!(transport.is_connected());

        // 两个心跳周期无任何入站帧后必须翻转为断开
        let mut disconnected = false;
        for _ in 0..80 {
            if !transport.is_connected() {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(disconnected, "unresponsive peer still reported connected");

        // 入站通道随之关闭
        assert!(inbound.recv().await.is_none());
        assert!(transport.send("{}".to_string()).await.is_err());

        silent_peer.abort();
    }

    #[tokio::test]
    async fn test_responsive_peer_stays_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 持续读取的对端：Ping 得到协议层 Pong 应答
        let reading_peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(msg) = ws.next().await {
                if msg.is_err() {
                    break;
                }
            }
        });

        let (transport, _inbound) =
            WsTransport::connect(&format!("ws://{}", addr), 1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(transport.is_connected(), "pong-answering peer dropped");

        transport.close().await;
        reading_peer.abort();
    }
}
