//! 动作注册表
//!
//! 符号动作名到处理器的查找表，外加必需参数校验。
//! 未知动作与缺参都以 `{success: false, error}` 信封返回，从不向上抛。

use serde_json::Map;

use super::browser::BrowserControl;
use super::protocol::ResultEnvelope;

/// 已注册的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    GetTabs,
    Screenshot,
    NewTab,
    Navigate,
    ClickElement,
    InputText,
    GrabDom,
    CaptureWithHighlights,
    SendKeys,
    SelectTab,
    CloseTab,
    SearchGoogle,
    Wait,
}

impl ActionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "get_tabs" => Self::GetTabs,
            "screenshot" => Self::Screenshot,
            "new_tab" => Self::NewTab,
            "navigate" => Self::Navigate,
            "click_element" => Self::ClickElement,
            "input_text" => Self::InputText,
            "grab_dom" => Self::GrabDom,
            "capture_with_highlights" => Self::CaptureWithHighlights,
            "send_keys" => Self::SendKeys,
            "select_tab" => Self::SelectTab,
            "close_tab" => Self::CloseTab,
            "search_google" => Self::SearchGoogle,
            "wait" => Self::Wait,
            _ => return None,
        })
    }

    /// 调用前必须出现的参数
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::NewTab | Self::Navigate => &["url"],
            Self::ClickElement => &["element_id"],
            Self::InputText => &["element_id", "text"],
            Self::SendKeys => &["keys"],
            Self::SelectTab => &["tab_id"],
            Self::SearchGoogle => &["query"],
            _ => &[],
        }
    }
}

fn get_str<'a>(params: &'a Map<String, serde_json::Value>, key: &str) -> &'a str {
    params.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

/// tab_id 兼容数字与数字字符串两种写法
fn get_tab_id(params: &Map<String, serde_json::Value>) -> Option<u64> {
    match params.get("tab_id") {
        Some(v) => v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())),
        None => None,
    }
}

/// 动作注册表：分发入口
pub struct ActionRegistry;

impl ActionRegistry {
    /// 查表、校验参数、执行，并把处理器结果收拢进统一信封
    pub async fn dispatch(
        action: &str,
        params: &Map<String, serde_json::Value>,
        browser: &dyn BrowserControl,
    ) -> ResultEnvelope {
        let kind = match ActionKind::from_name(action) {
            Some(k) => k,
            None => return ResultEnvelope::err(format!("Unknown action: {}", action)),
        };

        for required in kind.required_params() {
            let missing = match params.get(*required) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                return ResultEnvelope::err(format!("Missing required parameter: {}", required));
            }
        }

        let tab_id = get_tab_id(params);
        let outcome = match kind {
            ActionKind::GetTabs => browser.get_tabs().await,
            ActionKind::Screenshot => browser.screenshot(tab_id).await,
            ActionKind::NewTab => browser.new_tab(get_str(params, "url")).await,
            ActionKind::Navigate => browser.navigate(get_str(params, "url"), tab_id).await,
            ActionKind::ClickElement => {
                browser.click_element(get_str(params, "element_id"), tab_id).await
            }
            ActionKind::InputText => {
                browser
                    .input_text(get_str(params, "element_id"), get_str(params, "text"), tab_id)
                    .await
            }
            ActionKind::GrabDom => browser.grab_dom(tab_id).await,
            ActionKind::CaptureWithHighlights => browser.capture_with_highlights(tab_id).await,
            ActionKind::SendKeys => browser.send_keys(get_str(params, "keys"), tab_id).await,
            ActionKind::SelectTab => match tab_id {
                Some(id) => browser.select_tab(id).await,
                None => Err("Invalid tab ID format".to_string()),
            },
            ActionKind::CloseTab => browser.close_tab(tab_id).await,
            ActionKind::SearchGoogle => browser.search_google(get_str(params, "query"), tab_id).await,
            ActionKind::Wait => {
                let duration = params
                    .get("duration")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0);
                browser.wait(duration).await
            }
        };

        match outcome {
            Ok((data, message)) => ResultEnvelope::ok(data, &message),
            Err(error) => ResultEnvelope::err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::browser::MockBrowser;

    #[tokio::test]
    async fn test_unknown_action_yields_error_envelope() {
        let browser = MockBrowser::new(10);
        let env = ActionRegistry::dispatch("frobnicate", &Map::new(), &browser).await;
        assert!(!env.success);
        assert_eq!(env.error.as_deref(), Some("Unknown action: frobnicate"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let browser = MockBrowser::new(10);
        let env = ActionRegistry::dispatch("new_tab", &Map::new(), &browser).await;
        assert!(!env.success);
        assert!(env.error.unwrap().contains("url"));
    }

    #[tokio::test]
    async fn test_known_action_success_envelope() {
        let browser = MockBrowser::new(10);
        let mut params = Map::new();
        params.insert("url".into(), serde_json::json!("https://example.com"));
        let env = ActionRegistry::dispatch("new_tab", &params, &browser).await;
        assert!(env.success);
        assert!(env.data.unwrap()["id"].is_u64());
    }

    #[tokio::test]
    async fn test_tab_id_accepts_string_form() {
        let browser = MockBrowser::new(10);
        let mut params = Map::new();
        params.insert("url".into(), serde_json::json!("https://example.com"));
        let env = ActionRegistry::dispatch("new_tab", &params, &browser).await;
        let id = env.data.unwrap()["id"].as_u64().unwrap();

        let mut params = Map::new();
        params.insert("tab_id".into(), serde_json::json!(id.to_string()));
        let env = ActionRegistry::dispatch("select_tab", &params, &browser).await;
        assert!(env.success, "{:?}", env.error);
    }
}
