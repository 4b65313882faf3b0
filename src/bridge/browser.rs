//! 浏览器控制能力接口
//!
//! 分发器与编排器只依赖 `BrowserControl`，不关心背后是 mock 还是真实驱动。
//! 当前提供 `MockBrowser`：维护标签页状态并返回固定的页面快照 / 截图数据，
//! 用于在没有浏览器扩展的环境里跑通完整链路。

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use super::protocol::BrowserTab;

/// 动作处理结果：(data, message) 或错误描述。
/// 错误会被分发器包成 `{success: false, error}` 信封，不会中断连接。
pub type ActionResult = Result<(serde_json::Value, String), String>;

/// 浏览器控制能力
#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn get_tabs(&self) -> ActionResult;
    async fn screenshot(&self, tab_id: Option<u64>) -> ActionResult;
    async fn new_tab(&self, url: &str) -> ActionResult;
    async fn navigate(&self, url: &str, tab_id: Option<u64>) -> ActionResult;
    async fn click_element(&self, element_id: &str, tab_id: Option<u64>) -> ActionResult;
    async fn input_text(&self, element_id: &str, text: &str, tab_id: Option<u64>) -> ActionResult;
    async fn grab_dom(&self, tab_id: Option<u64>) -> ActionResult;
    async fn capture_with_highlights(&self, tab_id: Option<u64>) -> ActionResult;
    async fn send_keys(&self, keys: &str, tab_id: Option<u64>) -> ActionResult;
    async fn select_tab(&self, tab_id: u64) -> ActionResult;
    async fn close_tab(&self, tab_id: Option<u64>) -> ActionResult;
    async fn search_google(&self, query: &str, tab_id: Option<u64>) -> ActionResult;
    async fn wait(&self, duration_secs: f64) -> ActionResult;
}

/// 1x1 透明 PNG，占位截图
const MOCK_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

#[derive(Default)]
struct TabState {
    tabs: HashMap<u64, BrowserTab>,
    active: Option<u64>,
    /// 点进邮件前的来路，Alt+Left 时恢复
    previous: HashMap<u64, String>,
}

impl TabState {
    fn resolve(&self, tab_id: Option<u64>) -> Option<u64> {
        tab_id.or(self.active)
    }

    fn activate(&mut self, id: u64) {
        for tab in self.tabs.values_mut() {
            tab.active = tab.id == id;
        }
        self.active = Some(id);
    }
}

/// Mock 浏览器：标签页状态在内存中，其余数据为固定样本
pub struct MockBrowser {
    state: RwLock<TabState>,
    max_wait_secs: u64,
}

impl MockBrowser {
    pub fn new(max_wait_secs: u64) -> Self {
        Self {
            state: RwLock::new(TabState::default()),
            max_wait_secs,
        }
    }

    fn infer_title(url: &str) -> String {
        if url.contains("google.com") {
            "Google".to_string()
        } else if url.contains("illinoistech.edu") {
            "Illinois Tech".to_string()
        } else if url.contains("gmail.com") {
            "Gmail".to_string()
        } else {
            "Loading...".to_string()
        }
    }
}

#[async_trait]
impl BrowserControl for MockBrowser {
    async fn get_tabs(&self) -> ActionResult {
        let mut state = self.state.write().await;

        // 首次查询时播种样本标签页（真实实现由浏览器扩展上报）
        if state.tabs.is_empty() {
            let seed = [
                (1u64, "Gmail", "https://mail.google.com", true),
                (2, "Slate - Illinois Tech", "https://apply.illinoistech.edu", false),
                (3, "Google", "https://google.com", false),
            ];
            for (id, title, url, active) in seed {
                state.tabs.insert(
                    id,
                    BrowserTab {
                        id,
                        title: title.to_string(),
                        url: url.to_string(),
                        active,
                    },
                );
                if active {
                    state.active = Some(id);
                }
            }
        }

        let mut tabs: Vec<&BrowserTab> = state.tabs.values().collect();
        tabs.sort_by_key(|t| t.id);
        let data = serde_json::to_value(&tabs).map_err(|e| e.to_string())?;
        Ok((data, "Tabs retrieved successfully".to_string()))
    }

    async fn screenshot(&self, tab_id: Option<u64>) -> ActionResult {
        let state = self.state.read().await;
        let tab = state.resolve(tab_id);
        Ok((
            json!(MOCK_PNG),
            format!("Screenshot captured for tab {:?}", tab),
        ))
    }

    async fn new_tab(&self, url: &str) -> ActionResult {
        let mut state = self.state.write().await;
        let id = state.tabs.keys().max().copied().unwrap_or(0) + 1;
        state.tabs.insert(
            id,
            BrowserTab {
                id,
                title: "New Tab".to_string(),
                url: url.to_string(),
                active: true,
            },
        );
        state.activate(id);
        Ok((
            json!({"id": id, "url": url}),
            format!("New tab created with ID {}", id),
        ))
    }

    async fn navigate(&self, url: &str, tab_id: Option<u64>) -> ActionResult {
        if url.is_empty() {
            return Err("URL is required".to_string());
        }
        let mut state = self.state.write().await;
        let target = state.resolve(tab_id);
        if let Some(id) = target {
            if let Some(tab) = state.tabs.get_mut(&id) {
                tab.url = url.to_string();
                tab.title = Self::infer_title(url);
            }
        }
        Ok((
            json!({"url": url, "tab_id": target}),
            format!("Navigated to {}", url),
        ))
    }

    async fn click_element(&self, element_id: &str, tab_id: Option<u64>) -> ActionResult {
        if element_id.is_empty() {
            return Err("Element ID is required".to_string());
        }
        let mut state = self.state.write().await;
        let target = state.resolve(tab_id);

        // 收件箱页里点邮件条目相当于打开邮件：记住来路供 Alt+Left 返回
        if let Some(id) = target {
            let nav = state.tabs.get(&id).and_then(|tab| {
                let url = tab.url.clone();
                (url.to_lowercase().contains("inbox") && matches!(element_id, "1" | "2")).then(
                    || {
                        let opened =
                            format!("{}/{}", url.to_lowercase().replace("inbox", "email"), element_id);
                        (url, opened)
                    },
                )
            });
            if let Some((prev, opened)) = nav {
                state.previous.insert(id, prev);
                if let Some(tab) = state.tabs.get_mut(&id) {
                    tab.url = opened;
                }
            }
        }

        Ok((
            json!({"element_id": element_id, "tab_id": target}),
            format!("Clicked element {}", element_id),
        ))
    }

    async fn input_text(&self, element_id: &str, text: &str, tab_id: Option<u64>) -> ActionResult {
        if element_id.is_empty() {
            return Err("Element ID is required".to_string());
        }
        let state = self.state.read().await;
        let target = state.resolve(tab_id);
        // 回显时截断，避免日志里出现整封草稿
        let preview: String = if text.chars().count() > 100 {
            format!("{}...", text.chars().take(100).collect::<String>())
        } else {
            text.to_string()
        };
        Ok((
            json!({"element_id": element_id, "text": preview, "tab_id": target}),
            format!("Text input to element {}", element_id),
        ))
    }

    async fn grab_dom(&self, tab_id: Option<u64>) -> ActionResult {
        let state = self.state.read().await;
        let url = state
            .resolve(tab_id)
            .and_then(|id| state.tabs.get(&id))
            .map(|t| t.url.clone())
            .unwrap_or_default();

        let data = if url.to_lowercase().contains("inbox") {
            json!({
                "processedOutput": "Inbox:\n\
                    1. Email: \"Question about MS Robotics Program\"\n\
                    2. Email: \"Deposit refund request\"\n\
                    3. Refresh Button",
                "highlightToXPath": {
                    "1": "/html/body/a[@class='inbox-message-1']",
                    "2": "/html/body/a[@class='inbox-message-2']",
                    "3": "/html/body/button[@id='refresh']"
                },
                "html": format!("<html><head><title>Inbox</title></head><body><div class='inbox'>Mock inbox for {}</div></body></html>", url),
            })
        } else if url.contains("illinoistech.edu") || url.to_lowercase().contains("slate") {
            json!({
                "processedOutput": "Page Structure:\n\
                    1. Email Subject: \"Question about MS Robotics Program\"\n\
                    2. Reply Button (Click to respond)\n\
                    3. Email Body: \"Dear Admissions, I have questions about the MS in Robotics program. What are the admission requirements and tuition costs? Best regards, John Smith\"\n\
                    4. Text Area: (For composing response)\n\
                    5. Send Button\n\
                    6. Back to Inbox",
                "highlightToXPath": {
                    "1": "/html/body/div[@class='email-subject']",
                    "2": "/html/body/button[@id='reply-btn']",
                    "3": "/html/body/div[@class='email-content']",
                    "4": "/html/body/textarea[@id='response-text']",
                    "5": "/html/body/button[@id='send-btn']",
                    "6": "/html/body/a[@class='back-link']"
                },
                "html": format!("<html><head><title>Slate Email Interface</title></head><body><div class='email-interface'>Mock Slate content for {}</div></body></html>", url),
            })
        } else {
            json!({
                "processedOutput": "Page Elements:\n\
                    1. Navigation Menu\n\
                    2. Main Content Area\n\
                    3. Search Box\n\
                    4. Login Button\n\
                    5. Footer Links",
                "highlightToXPath": {
                    "1": "/html/body/nav",
                    "2": "/html/body/main",
                    "3": "/html/body/input[@type='search']",
                    "4": "/html/body/button[@class='login']",
                    "5": "/html/body/footer"
                },
                "html": format!("<html><head><title>Generic Page</title></head><body><div>Generic content for {}</div></body></html>", url),
            })
        };

        Ok((data, "DOM extracted successfully".to_string()))
    }

    async fn capture_with_highlights(&self, _tab_id: Option<u64>) -> ActionResult {
        let data = json!({
            "dataUrl": MOCK_PNG,
            "highlightCount": 6,
            "highlights": [
                {"id": "1", "type": "text", "bounds": {"x": 10, "y": 50, "width": 200, "height": 30}},
                {"id": "2", "type": "button", "bounds": {"x": 220, "y": 50, "width": 80, "height": 30}},
                {"id": "3", "type": "textarea", "bounds": {"x": 10, "y": 100, "width": 300, "height": 100}},
                {"id": "4", "type": "button", "bounds": {"x": 250, "y": 210, "width": 60, "height": 30}},
                {"id": "5", "type": "link", "bounds": {"x": 10, "y": 250, "width": 100, "height": 20}},
                {"id": "6", "type": "input", "bounds": {"x": 320, "y": 10, "width": 150, "height": 25}}
            ]
        });
        Ok((data, "Screenshot with 6 highlights captured".to_string()))
    }

    async fn send_keys(&self, keys: &str, tab_id: Option<u64>) -> ActionResult {
        if keys.is_empty() {
            return Err("Keys parameter is required".to_string());
        }
        let mut state = self.state.write().await;
        let target = state.resolve(tab_id);

        // Alt+Left：回到点开邮件前的页面
        if keys == "Alt+Left" {
            if let Some(id) = target {
                if let Some(prev) = state.previous.remove(&id) {
                    if let Some(tab) = state.tabs.get_mut(&id) {
                        tab.url = prev;
                    }
                }
            }
        }

        Ok((
            json!({"keys": keys, "tab_id": target}),
            format!("Sent key sequence: {}", keys),
        ))
    }

    async fn select_tab(&self, tab_id: u64) -> ActionResult {
        let mut state = self.state.write().await;
        if !state.tabs.contains_key(&tab_id) {
            return Err(format!("Tab {} not found", tab_id));
        }
        state.activate(tab_id);
        let title = state.tabs[&tab_id].title.clone();
        Ok((
            json!({"tab_id": tab_id, "title": title}),
            format!("Selected tab {}", tab_id),
        ))
    }

    async fn close_tab(&self, tab_id: Option<u64>) -> ActionResult {
        let mut state = self.state.write().await;
        let target = match state.resolve(tab_id) {
            Some(id) => id,
            None => return Err("No tab to close".to_string()),
        };
        state.tabs.remove(&target);
        if state.active == Some(target) {
            state.active = state.tabs.keys().min().copied();
            if let Some(next) = state.active {
                state.activate(next);
            }
        }
        Ok((
            json!({"closed_tab_id": target}),
            format!("Closed tab {}", target),
        ))
    }

    async fn search_google(&self, query: &str, tab_id: Option<u64>) -> ActionResult {
        if query.is_empty() {
            return Err("Search query is required".to_string());
        }
        let search_url = format!("https://www.google.com/search?q={}", query.replace(' ', "+"));
        let mut state = self.state.write().await;
        let target = state.resolve(tab_id);
        if let Some(id) = target {
            if let Some(tab) = state.tabs.get_mut(&id) {
                tab.url = search_url.clone();
                tab.title = format!("Google Search: {}", query);
            }
        }
        Ok((
            json!({"query": query, "url": search_url, "tab_id": target}),
            format!("Google search for '{}' initiated", query),
        ))
    }

    async fn wait(&self, duration_secs: f64) -> ActionResult {
        // 上限防滥用
        let capped = duration_secs.max(0.0).min(self.max_wait_secs as f64);
        tokio::time::sleep(std::time::Duration::from_secs_f64(capped)).await;
        Ok((
            json!({"duration": capped}),
            format!("Waited for {} seconds", capped),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_tab_then_navigate_updates_same_tab() {
        let browser = MockBrowser::new(10);
        let (data, _) = browser.new_tab("https://example.com").await.unwrap();
        let id = data["id"].as_u64().unwrap();

        browser.navigate("https://other.com", Some(id)).await.unwrap();

        let (tabs, _) = browser.get_tabs().await.unwrap();
        let tab = tabs
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["id"].as_u64() == Some(id))
            .unwrap();
        assert_eq!(tab["url"], "https://other.com");
    }

    #[tokio::test]
    async fn test_wait_is_capped() {
        let browser = MockBrowser::new(1);
        let start = std::time::Instant::now();
        let (data, _) = browser.wait(100.0).await.unwrap();
        assert!(start.elapsed().as_secs() <= 2);
        assert_eq!(data["duration"], 1.0);
    }

    #[tokio::test]
    async fn test_input_text_echo_truncated() {
        let browser = MockBrowser::new(10);
        let long = "x".repeat(300);
        let (data, _) = browser.input_text("4", &long, None).await.unwrap();
        let echoed = data["text"].as_str().unwrap();
        assert!(echoed.len() <= 103);
        assert!(echoed.ends_with("..."));
    }

    #[tokio::test]
    async fn test_inbox_click_opens_email_and_alt_left_returns() {
        let browser = MockBrowser::new(10);
        let (data, _) = browser
            .new_tab("https://apply.illinoistech.edu/inbox")
            .await
            .unwrap();
        let id = data["id"].as_u64().unwrap();

        browser.click_element("1", Some(id)).await.unwrap();
        let (dom, _) = browser.grab_dom(Some(id)).await.unwrap();
        assert!(dom["processedOutput"]
            .as_str()
            .unwrap()
            .contains("Reply Button"));

        browser.send_keys("Alt+Left", Some(id)).await.unwrap();
        let (dom, _) = browser.grab_dom(Some(id)).await.unwrap();
        assert!(dom["processedOutput"].as_str().unwrap().starts_with("Inbox"));
    }

    #[tokio::test]
    async fn test_select_missing_tab_fails_softly() {
        let browser = MockBrowser::new(10);
        let err = browser.select_tab(42).await.unwrap_err();
        assert!(err.contains("not found"));
    }
}
