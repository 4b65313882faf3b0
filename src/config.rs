//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COUNSELOR__*` 覆盖
//! （双下划线表示嵌套，如 `COUNSELOR__BRIDGE__PEER_URL=ws://...`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub knowledge: KnowledgeSection,
}

/// [app] 段：HTTP 控制面监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// HTTP API 监听地址
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            api_bind: default_api_bind(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// [bridge] 段：浏览器桥接（WebSocket）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// 对端（浏览器侧）WebSocket 地址
    #[serde(default = "default_peer_url")]
    pub peer_url: String,
    /// 分发器监听地址（counselor-peer 使用）
    #[serde(default = "default_bridge_bind")]
    pub bind_addr: String,
    /// 单次动作请求超时（秒）
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    /// 心跳 keepalive 间隔（秒）
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// wait 动作允许的最长等待（秒，防滥用上限）
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// 页面加载固定等待（秒）
    #[serde(default = "default_page_load_secs")]
    pub page_load_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            peer_url: default_peer_url(),
            bind_addr: default_bridge_bind(),
            action_timeout_secs: default_action_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            max_wait_secs: default_max_wait_secs(),
            page_load_secs: default_page_load_secs(),
        }
    }
}

fn default_peer_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_bridge_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_action_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_max_wait_secs() -> u64 {
    10
}

fn default_page_load_secs() -> u64 {
    3
}

/// [llm] 段：回复生成后端与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 生成调用超时（秒），独立于动作超时
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            generation_timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    60
}

/// [knowledge] 段：知识库存储
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    /// 知识库 JSON 文件路径
    #[serde(default = "default_kb_path")]
    pub path: PathBuf,
    /// query 返回的最大片段数
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            path: default_kb_path(),
            top_k: default_top_k(),
        }
    }
}

fn default_kb_path() -> PathBuf {
    PathBuf::from("data/knowledge_base.json")
}

fn default_top_k() -> usize {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            bridge: BridgeSection::default(),
            llm: LlmSection::default(),
            knowledge: KnowledgeSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 COUNSELOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COUNSELOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COUNSELOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bridge.action_timeout_secs, 30);
        assert_eq!(cfg.bridge.max_wait_secs, 10);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.knowledge.top_k, 3);
    }
}
