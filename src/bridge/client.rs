//! 关联追踪器与动作客户端
//!
//! `submit(action, params, timeout)`：生成进程内唯一的请求 id，登记挂起调用，
//! 发送帧并挂起调用方，直到 (a) 匹配 id 的响应到达，或 (b) 超时并丢弃挂起记录。
//! 路由任务按 id 分发响应——对端可能乱序应答，同一连接上的并发调用
//! 绝不会看到彼此的结果；迟到的响应直接丢弃。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use super::protocol::{ActionRequest, BrowserTab, DomSnapshot, ResultEnvelope, Welcome};
use super::transport::{PeerTransport, WsTransport};
use crate::config::BridgeSection;
use crate::error::{Error, Result};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ResultEnvelope>>>>;

/// 桥接客户端：一条连接上的关联调用
pub struct BridgeClient {
    transport: Arc<dyn PeerTransport>,
    pending: PendingMap,
    peer_info: Arc<RwLock<Option<Welcome>>>,
    counter: AtomicU64,
    default_timeout: Duration,
}

impl BridgeClient {
    /// 在已建立的传输上启动路由任务
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        mut inbound_rx: mpsc::UnboundedReceiver<String>,
        default_timeout_secs: u64,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let peer_info = Arc::new(RwLock::new(None));

        let pending_r = Arc::clone(&pending);
        let peer_info_r = Arc::clone(&peer_info);
        tokio::spawn(async move {
            while let Some(text) = inbound_rx.recv().await {
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("Discarding unparseable frame: {}", e);
                        continue;
                    }
                };

                if value.get("result").is_some() {
                    let id = value.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                    let envelope: ResultEnvelope =
                        match serde_json::from_value(value["result"].clone()) {
                            Ok(env) => env,
                            Err(e) => {
                                tracing::warn!("Malformed result envelope for {}: {}", id, e);
                                continue;
                            }
                        };
                    match pending_r.lock().await.remove(id) {
                        Some(waiter) => {
                            let _ = waiter.send(envelope);
                        }
                        None => {
                            // 超时后迟到的响应：静默丢弃
                            tracing::debug!("Discarding late response for {}", id);
                        }
                    }
                } else if value.get("type").and_then(|v| v.as_str()) == Some("welcome") {
                    if let Ok(welcome) = serde_json::from_value::<Welcome>(value) {
                        tracing::info!(
                            "Peer welcome: {} (protocol {})",
                            welcome.client_id,
                            welcome.server_info.version
                        );
                        *peer_info_r.write().await = Some(welcome);
                    }
                } else {
                    tracing::debug!("Ignoring unsolicited frame");
                }
            }
        });

        Self {
            transport,
            pending,
            peer_info,
            counter: AtomicU64::new(0),
            default_timeout: Duration::from_secs(default_timeout_secs),
        }
    }

    /// 按配置连接 WebSocket 对端
    pub async fn connect(cfg: &BridgeSection) -> Result<Self> {
        let (transport, inbound_rx) =
            WsTransport::connect(&cfg.peer_url, cfg.keepalive_secs).await?;
        Ok(Self::new(transport, inbound_rx, cfg.action_timeout_secs))
    }

    /// 进程内唯一：单调计数器 + 随机后缀
    fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{}_{}", &suffix[..8], n)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn peer_info(&self) -> Option<Welcome> {
        self.peer_info.read().await.clone()
    }

    pub async fn close(&self) {
        self.transport.close().await;
        self.pending.lock().await.clear();
    }

    /// 发送动作并等待匹配响应；success=false 转为 ActionFailed
    pub async fn submit(
        &self,
        action: &str,
        params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.next_request_id();
        let request = ActionRequest::new(request_id.clone(), action, params);
        let frame = serde_json::to_string(&request)
            .map_err(|e| Error::Protocol(format!("Serialize error: {}", e)))?;

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request_id.clone(), waiter_tx);

        tracing::debug!("Sending action {} ({})", action, request_id);
        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, waiter_rx).await {
            Ok(Ok(envelope)) => {
                if envelope.success {
                    Ok(envelope.data.unwrap_or(Value::Null))
                } else {
                    Err(Error::ActionFailed(
                        envelope
                            .error
                            .unwrap_or_else(|| format!("Action {} failed", action)),
                    ))
                }
            }
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request_id);
                Err(Error::Connection("Response channel closed".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(Error::Timeout(timeout.as_secs(), action.to_string()))
            }
        }
    }

    /// 以默认超时发送动作
    pub async fn submit_default(&self, action: &str, params: Map<String, Value>) -> Result<Value> {
        self.submit(action, params, self.default_timeout).await
    }

    // ------------------------------------------------------------------
    // 类型化动作封装
    // ------------------------------------------------------------------

    pub async fn get_tabs(&self) -> Result<Vec<BrowserTab>> {
        let data = self.submit_default("get_tabs", Map::new()).await?;
        serde_json::from_value(data).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// 返回新标签页 id
    pub async fn new_tab(&self, url: &str) -> Result<u64> {
        let data = self.submit_default("new_tab", params([("url", json!(url))])).await?;
        data["id"]
            .as_u64()
            .ok_or_else(|| Error::Protocol("new_tab response missing id".to_string()))
    }

    pub async fn navigate(&self, url: &str, tab_id: Option<u64>) -> Result<Value> {
        let mut p = params([("url", json!(url))]);
        insert_tab(&mut p, tab_id);
        self.submit_default("navigate", p).await
    }

    pub async fn screenshot(&self, tab_id: Option<u64>) -> Result<String> {
        let mut p = Map::new();
        insert_tab(&mut p, tab_id);
        let data = self.submit_default("screenshot", p).await?;
        Ok(data.as_str().unwrap_or_default().to_string())
    }

    pub async fn grab_dom(&self, tab_id: Option<u64>) -> Result<DomSnapshot> {
        let mut p = Map::new();
        insert_tab(&mut p, tab_id);
        let data = self.submit_default("grab_dom", p).await?;
        serde_json::from_value(data).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub async fn click_element(&self, element_id: &str, tab_id: Option<u64>) -> Result<Value> {
        let mut p = params([("element_id", json!(element_id))]);
        insert_tab(&mut p, tab_id);
        self.submit_default("click_element", p).await
    }

    pub async fn input_text(
        &self,
        element_id: &str,
        text: &str,
        tab_id: Option<u64>,
    ) -> Result<Value> {
        let mut p = params([("element_id", json!(element_id)), ("text", json!(text))]);
        insert_tab(&mut p, tab_id);
        self.submit_default("input_text", p).await
    }

    /// 返回高亮截图的 data URI
    pub async fn capture_with_highlights(&self, tab_id: Option<u64>) -> Result<String> {
        let mut p = Map::new();
        insert_tab(&mut p, tab_id);
        let data = self.submit_default("capture_with_highlights", p).await?;
        Ok(data["dataUrl"].as_str().unwrap_or_default().to_string())
    }

    pub async fn send_keys(&self, keys: &str, tab_id: Option<u64>) -> Result<Value> {
        let mut p = params([("keys", json!(keys))]);
        insert_tab(&mut p, tab_id);
        self.submit_default("send_keys", p).await
    }

    pub async fn close_tab(&self, tab_id: Option<u64>) -> Result<Value> {
        let mut p = Map::new();
        insert_tab(&mut p, tab_id);
        self.submit_default("close_tab", p).await
    }
}

fn params<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn insert_tab(p: &mut Map<String, Value>, tab_id: Option<u64>) {
    if let Some(id) = tab_id {
        p.insert("tab_id".to_string(), json!(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ActionResponse;
    use crate::bridge::transport::ChannelTransport;

    fn respond(frame: &str, data: Value) -> String {
        let req: Value = serde_json::from_str(frame).unwrap();
        let id = req["id"].as_str().unwrap();
        serde_json::to_string(&ActionResponse::ok(id, data, "ok")).unwrap()
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (transport, in_rx, mut peer) = ChannelTransport::pair();
        let client = Arc::new(BridgeClient::new(transport, in_rx, 5));

        // 对端攒两条请求后倒序应答
        let inbound = peer.inbound_tx.clone();
        tokio::spawn(async move {
            let first = peer.outbound_rx.recv().await.unwrap();
            let second = peer.outbound_rx.recv().await.unwrap();
            inbound.send(respond(&second, json!({"n": 2}))).unwrap();
            inbound.send(respond(&first, json!({"n": 1}))).unwrap();
        });

        let c1 = Arc::clone(&client);
        let c2 = Arc::clone(&client);
        let (r1, r2) = tokio::join!(
            c1.submit("screenshot", Map::new(), Duration::from_secs(5)),
            c2.submit("grab_dom", Map::new(), Duration::from_secs(5)),
        );

        assert_eq!(r1.unwrap()["n"], 1);
        assert_eq!(r2.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_response_discarded() {
        let (transport, in_rx, mut peer) = ChannelTransport::pair();
        let client = BridgeClient::new(transport, in_rx, 5);

        let result = client
            .submit("grab_dom", Map::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_, _))));
        assert!(client.pending.lock().await.is_empty());

        // 迟到响应：无人等待，丢弃且不影响后续调用
        let frame = peer.outbound_rx.recv().await.unwrap();
        peer.inbound_tx
            .send(respond(&frame, json!({"late": true})))
            .unwrap();

        let inbound = peer.inbound_tx.clone();
        tokio::spawn(async move {
            let frame = peer.outbound_rx.recv().await.unwrap();
            inbound.send(respond(&frame, json!({"fresh": true}))).unwrap();
        });

        let result = client
            .submit("grab_dom", Map::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["fresh"], true);
    }

    #[tokio::test]
    async fn test_action_failure_becomes_error() {
        let (transport, in_rx, mut peer) = ChannelTransport::pair();
        let client = BridgeClient::new(transport, in_rx, 5);

        let inbound = peer.inbound_tx.clone();
        tokio::spawn(async move {
            let frame = peer.outbound_rx.recv().await.unwrap();
            let req: Value = serde_json::from_str(&frame).unwrap();
            let resp = ActionResponse::err(req["id"].as_str().unwrap(), "Element 9 not found");
            inbound.send(serde_json::to_string(&resp).unwrap()).unwrap();
        });

        let err = client
            .click_element("9", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActionFailed(_)));
    }

    #[tokio::test]
    async fn test_welcome_stored_as_peer_info() {
        let (transport, in_rx, peer) = ChannelTransport::pair();
        let client = BridgeClient::new(transport, in_rx, 5);

        let welcome = Welcome::new("client_7_0");
        peer.inbound_tx
            .send(serde_json::to_string(&welcome).unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = client.peer_info().await.unwrap();
        assert_eq!(info.client_id, "client_7_0");
    }
}
