//! 桥接线协议定义
//!
//! 请求：`{"action": <name>, "id"?: <string>, ...参数}`，id 缺省时由分发器生成。
//! 响应：`{"id": <string>, "result": {success, data?, message?, error?, timestamp}}`。
//! 连接建立时分发器主动推送一条 welcome 消息（对端 id、协议版本、能力列表）。
//! 所有时间戳为浮点秒。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 协议版本（welcome 消息中携带）
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// JSON 解析失败时响应使用的哨兵 id
pub const SENTINEL_ID: &str = "unknown";

/// 对端能力列表
pub const CAPABILITIES: &[&str] = &[
    "tab_management",
    "navigation",
    "element_interaction",
    "dom_extraction",
    "screenshot_capture",
    "keyboard_input",
];

/// 当前时刻的浮点秒时间戳
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// 出站动作请求（发送后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub action: String,
    /// 动作参数（与 id/action 平铺在同一 JSON 对象中）
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ActionRequest {
    pub fn new(id: String, action: &str, params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id,
            action: action.to_string(),
            params,
        }
    }
}

/// 统一结果信封：调用方总能先判 success 再取载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: f64,
}

impl ResultEnvelope {
    pub fn ok(data: serde_json::Value, message: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.to_string()),
            error: None,
            timestamp: now_ts(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(error.into()),
            timestamp: now_ts(),
        }
    }
}

/// 动作响应：每个请求 id 恰好对应一条
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub id: String,
    pub result: ResultEnvelope,
}

impl ActionResponse {
    pub fn ok(id: &str, data: serde_json::Value, message: &str) -> Self {
        Self {
            id: id.to_string(),
            result: ResultEnvelope::ok(data, message),
        }
    }

    pub fn err(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            result: ResultEnvelope::err(error),
        }
    }
}

/// 连接建立时分发器主动推送的欢迎消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub server_info: ServerInfo,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub capabilities: Vec<String>,
}

impl Welcome {
    pub fn new(client_id: &str) -> Self {
        Self {
            kind: "welcome".to_string(),
            client_id: client_id.to_string(),
            server_info: ServerInfo {
                version: PROTOCOL_VERSION.to_string(),
                capabilities: CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            },
            timestamp: now_ts(),
        }
    }
}

/// 浏览器标签页描述（对端资源，核心只持有引用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserTab {
    pub id: u64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub active: bool,
}

/// 页面结构快照：文本化大纲 + 元素 id 到定位符映射 + 原始标记
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomSnapshot {
    #[serde(rename = "processedOutput", default)]
    pub processed_output: String,
    #[serde(rename = "highlightToXPath", default)]
    pub highlight_to_xpath: HashMap<String, String>,
    #[serde(default)]
    pub html: String,
}

/// 带高亮框的截图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightCapture {
    #[serde(rename = "dataUrl")]
    pub data_url: String,
    #[serde(rename = "highlightCount")]
    pub highlight_count: usize,
    pub highlights: Vec<Highlight>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Highlight {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip_flattens_params() {
        let mut params = serde_json::Map::new();
        params.insert("url".into(), serde_json::json!("https://example.com"));
        let req = ActionRequest::new("req_1".into(), "new_tab", params);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "new_tab");
        assert_eq!(json["url"], "https://example.com");
        assert_eq!(json["id"], "req_1");
    }

    #[test]
    fn test_error_envelope_omits_data() {
        let resp = ActionResponse::err("req_2", "Unknown action: frobnicate");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(!json.contains("\"data\""));
        assert!(json.contains("Unknown action: frobnicate"));
    }

    #[test]
    fn test_welcome_shape() {
        let w = Welcome::new("client_1");
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["server_info"]["version"], PROTOCOL_VERSION);
    }
}
