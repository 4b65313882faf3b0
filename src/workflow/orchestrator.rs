//! 回信工作流编排器
//!
//! 把桥接动作串成两条工作流：
//! - 单封：打开邮件页 → 截图 → 抽取正文 → 检索知识库并生成草稿 →
//!   定位元素 → 点回复 → 填入草稿 → 高亮截图。
//! - 批量：打开收件箱 → 找邮件链接 → 逐封在当前标签页内处理，
//!   处理完按 Alt+Left 返回；单封失败不拖垮整批。
//!
//! 两条流都只起草，绝不点击发送按钮。任务在后台运行，进度写入任务表，
//! 取消在步骤边界生效；所有退出路径都关闭桥接连接。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::bridge::BridgeClient;
use crate::config::{AppConfig, BridgeSection};
use crate::error::Result;
use crate::knowledge::{KnowledgeStore, Section};
use crate::llm::{ReplyGenerator, APOLOGY_FALLBACK};
use crate::workflow::extract::{extract_email_content, find_email_elements, find_email_links};
use crate::workflow::task::{TaskId, TaskKind, TaskStatus, TaskTable};

/// 回复界面点击后的渲染等待
const REPLY_RENDER_WAIT: Duration = Duration::from_millis(500);
/// 返回收件箱的按键序列
const BACK_KEYS: &str = "Alt+Left";

pub struct Orchestrator {
    bridge_cfg: BridgeSection,
    llm_timeout: Duration,
    table: Arc<TaskTable>,
    generator: Arc<dyn ReplyGenerator>,
    knowledge: Arc<KnowledgeStore>,
}

impl Orchestrator {
    pub fn new(
        cfg: &AppConfig,
        table: Arc<TaskTable>,
        generator: Arc<dyn ReplyGenerator>,
        knowledge: Arc<KnowledgeStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge_cfg: cfg.bridge.clone(),
            llm_timeout: Duration::from_secs(cfg.llm.generation_timeout_secs),
            table,
            generator,
            knowledge,
        })
    }

    /// 启动单封邮件工作流，立即返回可轮询的任务 id
    pub async fn start_single(self: Arc<Self>, url: &str) -> TaskId {
        let id = self.table.create(TaskKind::SingleEmail, url).await;
        let task_id = id.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            self.run_single(task_id, url).await;
        });
        id
    }

    /// 启动批量工作流（最多处理 count 封），立即返回可轮询的任务 id
    pub async fn start_bulk(self: Arc<Self>, inbox_url: &str, count: usize) -> TaskId {
        let id = self.table.create(TaskKind::BulkEmail, inbox_url).await;
        let task_id = id.clone();
        let url = inbox_url.to_string();
        tokio::spawn(async move {
            self.run_bulk(task_id, url, count).await;
        });
        id
    }

    async fn run_single(&self, id: TaskId, url: String) {
        let client = match BridgeClient::connect(&self.bridge_cfg).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Task {}: bridge connection failed: {}", id, e);
                self.table
                    .fail(&id, &format!("Bridge connection failed: {}", e))
                    .await;
                return;
            }
        };

        let outcome = self.single_steps(&id, &client, &url).await;
        client.close().await;

        match outcome {
            Ok(Some(results)) => {
                self.table.set_progress(&id, "Draft ready for review").await;
                self.table.complete(&id, results).await;
                tracing::info!("Task {} completed", id);
            }
            Ok(None) => {
                tracing::info!("Task {} cancelled", id);
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", id, e);
                self.table.fail(&id, &e.to_string()).await;
            }
        }
    }

    /// 单封流程主体；Ok(None) 表示在某个步骤边界发现任务已被取消
    async fn single_steps(
        &self,
        id: &str,
        client: &BridgeClient,
        url: &str,
    ) -> Result<Option<Value>> {
        self.table.set_status(id, TaskStatus::Running).await;
        self.table.set_progress(id, "Opening email page...").await;

        let tab = client.new_tab(url).await?;
        tokio::time::sleep(Duration::from_secs(self.bridge_cfg.page_load_secs)).await;
        if self.table.is_cancelled(id).await {
            return Ok(None);
        }

        self.table.set_progress(id, "Capturing page...").await;
        let shot = client.screenshot(Some(tab)).await?;
        self.table.push_screenshot(id, shot).await;

        match self.process_open_email(id, client, Some(tab)).await? {
            Some(item) => Ok(Some(item)),
            None => Ok(None),
        }
    }

    async fn run_bulk(&self, id: TaskId, url: String, count: usize) {
        let client = match BridgeClient::connect(&self.bridge_cfg).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Task {}: bridge connection failed: {}", id, e);
                self.table
                    .fail(&id, &format!("Bridge connection failed: {}", e))
                    .await;
                return;
            }
        };

        let outcome = self.bulk_steps(&id, &client, &url, count).await;
        client.close().await;

        match outcome {
            Ok(Some(results)) => {
                self.table.set_progress(&id, "Bulk run finished").await;
                self.table.complete(&id, results).await;
                tracing::info!("Task {} completed", id);
            }
            Ok(None) => {
                tracing::info!("Task {} cancelled", id);
            }
            Err(e) => {
                tracing::error!("Task {} failed: {}", id, e);
                self.table.fail(&id, &e.to_string()).await;
            }
        }
    }

    /// 批量流程主体：邮件在收件箱所在标签页内就地处理，处理完按键返回。
    /// 单封的失败记入明细后继续下一封；返回失败会中断余下条目。
    async fn bulk_steps(
        &self,
        id: &str,
        client: &BridgeClient,
        inbox_url: &str,
        count: usize,
    ) -> Result<Option<Value>> {
        self.table.set_status(id, TaskStatus::Running).await;
        self.table.set_progress(id, "Opening inbox...").await;

        let tab = client.new_tab(inbox_url).await?;
        tokio::time::sleep(Duration::from_secs(self.bridge_cfg.page_load_secs)).await;
        if self.table.is_cancelled(id).await {
            return Ok(None);
        }

        let shot = client.screenshot(Some(tab)).await?;
        self.table.push_screenshot(id, shot).await;

        let snapshot = client.grab_dom(Some(tab)).await?;
        let mut links = find_email_links(&snapshot);
        links.truncate(count.max(1));
        if links.is_empty() {
            tracing::warn!("Task {}: no email links found in inbox", id);
            return Ok(Some(json!({
                "total": 0,
                "succeeded": 0,
                "failed": 0,
                "items": [],
            })));
        }

        let total = links.len();
        let mut items = Vec::with_capacity(total);
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for (index, link) in links.iter().enumerate() {
            if self.table.is_cancelled(id).await {
                return Ok(None);
            }
            self.table
                .set_progress(id, &format!("Processing email {}/{}", index + 1, total))
                .await;

            let item = async {
                client.click_element(link, Some(tab)).await?;
                tokio::time::sleep(Duration::from_secs(self.bridge_cfg.page_load_secs)).await;
                self.process_open_email(id, client, Some(tab)).await
            }
            .await;

            match item {
                Ok(Some(detail)) => {
                    succeeded += 1;
                    items.push(json!({"index": index, "status": "ok", "detail": detail}));
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Task {}: email {} failed: {}", id, index + 1, e);
                    items.push(json!({"index": index, "status": "error", "error": e.to_string()}));
                }
            }

            // 回不去收件箱就没法继续，带着已有明细收尾
            if let Err(e) = client.send_keys(BACK_KEYS, Some(tab)).await {
                tracing::warn!("Task {}: failed to return to inbox: {}", id, e);
                break;
            }
            tokio::time::sleep(REPLY_RENDER_WAIT).await;
        }

        Ok(Some(json!({
            "total": total,
            "succeeded": succeeded,
            "failed": failed,
            "items": items,
        })))
    }

    /// 处理当前已打开的邮件页：抽取 → 生成 → 点回复 → 填入 → 高亮截图。
    /// 定位到的发送按钮只用于避让，任何路径都不会点击它。
    async fn process_open_email(
        &self,
        id: &str,
        client: &BridgeClient,
        tab: Option<u64>,
    ) -> Result<Option<Value>> {
        self.table.set_progress(id, "Reading email content...").await;
        let snapshot = client.grab_dom(tab).await?;
        let content = extract_email_content(&snapshot.processed_output)?;
        if self.table.is_cancelled(id).await {
            return Ok(None);
        }

        self.table.set_progress(id, "Drafting reply...").await;
        let hits = self.knowledge.query(&content).await;
        let prompt = build_prompt(&content, &hits);
        let reply = match self.generator.generate(&prompt, self.llm_timeout).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Task {}: reply generation failed, using fallback: {}", id, e);
                APOLOGY_FALLBACK.to_string()
            }
        };
        if self.table.is_cancelled(id).await {
            return Ok(None);
        }

        self.table.set_progress(id, "Locating reply controls...").await;
        let mut elements = find_email_elements(&snapshot);
        if let Some((button, heuristic)) = elements.reply_button.clone() {
            tracing::debug!("Task {}: reply button {} via {}", id, button, heuristic);
            client.click_element(&button, tab).await?;
            tokio::time::sleep(REPLY_RENDER_WAIT).await;
            // 点开回复后界面会变，重新定位输入区
            let reopened = client.grab_dom(tab).await?;
            let refreshed = find_email_elements(&reopened);
            if refreshed.text_area.is_some() {
                elements = refreshed;
            }
        }
        if self.table.is_cancelled(id).await {
            return Ok(None);
        }

        let (area, area_heuristic) = elements
            .text_area
            .ok_or_else(|| crate::error::Error::Extraction("No text area located".to_string()))?;

        self.table.set_progress(id, "Filling in draft...").await;
        client.input_text(&area, &reply, tab).await?;

        let capture = client.capture_with_highlights(tab).await?;
        if !capture.is_empty() {
            self.table.push_screenshot(id, capture).await;
        }

        Ok(Some(json!({
            "email_content": content,
            "draft_reply": reply,
            "text_area": {"id": area, "heuristic": area_heuristic},
            "reply_button": elements.reply_button.map(|(e, h)| json!({"id": e, "heuristic": h})),
            "send_button_avoided": elements.send_button.map(|(e, _)| e),
            "knowledge_ids": hits.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        })))
    }
}

/// 拼装生成提示词：知识片段在前，邮件正文在后
fn build_prompt(email: &str, sections: &[Section]) -> String {
    let mut prompt = String::from(
        "You are drafting a reply on behalf of the Office of Graduate Admissions at \
         Illinois Institute of Technology.\n\n",
    );

    if !sections.is_empty() {
        prompt.push_str("Relevant knowledge base entries:\n");
        for section in sections {
            prompt.push_str(&format!("### {}\n{}\n\n", section.title, section.content));
        }
    }

    prompt.push_str(&format!(
        "Student email:\n{}\n\n\
         Write a professional, warm reply that answers the questions above using the \
         knowledge base entries where applicable. Do not invent policies. \
         Sign off as Graduate Admissions.",
        email
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockReplyGenerator;

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        // 无人监听的端口，连接立即失败
        cfg.bridge.peer_url = "ws://127.0.0.1:1".to_string();
        cfg.bridge.page_load_secs = 0;
        cfg
    }

    fn test_orchestrator(cfg: &AppConfig) -> (tempfile::TempDir, Arc<Orchestrator>, Arc<TaskTable>) {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = KnowledgeStore::open(dir.path().join("kb.json"), 3).unwrap();
        let table = TaskTable::new(16);
        let orchestrator = Orchestrator::new(
            cfg,
            Arc::clone(&table),
            Arc::new(MockReplyGenerator::new()),
            knowledge,
        );
        (dir, orchestrator, table)
    }

    #[test]
    fn test_prompt_includes_knowledge_and_email() {
        let sections = vec![Section {
            id: "kb-3".to_string(),
            title: "TOEFL/IELTS Requirement".to_string(),
            content: "Scores are required for international students.".to_string(),
        }];
        let prompt = build_prompt("Do I need TOEFL?", &sections);
        assert!(prompt.contains("### TOEFL/IELTS Requirement"));
        assert!(prompt.contains("Do I need TOEFL?"));
    }

    #[test]
    fn test_prompt_without_knowledge_hits() {
        let prompt = build_prompt("Hello", &[]);
        assert!(!prompt.contains("knowledge base entries:\n###"));
        assert!(prompt.contains("Student email:\nHello"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_marks_task_failed() {
        let cfg = test_config();
        let (_dir, orchestrator, table) = test_orchestrator(&cfg);

        let id = Arc::clone(&orchestrator)
            .start_single("https://apply.illinoistech.edu/email/1")
            .await;
        for _ in 0..100 {
            if table.get(&id).await.unwrap().is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let task = table.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("Bridge connection failed"));
    }
}
