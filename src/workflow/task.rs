//! 任务表
//!
//! 工作流以后台任务形式运行，调用方通过轮询观察进度。表驻留内存，
//! 条目数有上限：超限时优先淘汰最旧的已结束任务；不跨重启持久化。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// 工作流种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SingleEmail,
    BulkEmail,
}

/// 一次可轮询的编排任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    /// 目标 URL（单封邮件页或收件箱）
    pub url: String,
    pub status: TaskStatus,
    /// 面向人的进度描述
    pub progress: String,
    /// 过程中捕获的截图（data URI）
    pub screenshots: Vec<String>,
    /// 结果载荷（完成时填充）
    pub results: serde_json::Value,
    pub error: Option<String>,
    /// 毫秒时间戳
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl TaskRecord {
    fn new(kind: TaskKind, url: String) -> Self {
        let prefix = match kind {
            TaskKind::SingleEmail => "single",
            TaskKind::BulkEmail => "bulk",
        };
        Self {
            id: format!("{}_{}", prefix, uuid::Uuid::new_v4().simple()),
            kind,
            url,
            status: TaskStatus::Initializing,
            progress: "Connecting to bridge...".to_string(),
            screenshots: Vec::new(),
            results: serde_json::Value::Null,
            error: None,
            started_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 任务表：RwLock 保护的内存表，容量受限
pub struct TaskTable {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    max_entries: usize,
}

impl TaskTable {
    pub fn new(max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        })
    }

    /// 新建任务并在超限时淘汰最旧的已结束条目
    pub async fn create(&self, kind: TaskKind, url: &str) -> TaskId {
        let record = TaskRecord::new(kind, url.to_string());
        let id = record.id.clone();
        let mut tasks = self.tasks.write().await;
        tasks.insert(id.clone(), record);

        while tasks.len() > self.max_entries {
            let oldest = tasks
                .values()
                .filter(|t| t.is_finished())
                .min_by_key(|t| t.started_at)
                .map(|t| t.id.clone());
            match oldest {
                Some(victim) => {
                    tasks.remove(&victim);
                }
                // 全部在跑：超限但不丢活
                None => break,
            }
        }
        id
    }

    pub async fn get(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        let mut all: Vec<TaskRecord> = self.tasks.read().await.values().cloned().collect();
        all.sort_by_key(|t| std::cmp::Reverse(t.started_at));
        all
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    pub async fn total_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn set_status(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            // 取消可能先于状态推进到达
            if task.status == TaskStatus::Cancelled {
                return;
            }
            task.status = status;
            if task.is_finished() && task.ended_at.is_none() {
                task.ended_at = Some(chrono::Utc::now().timestamp_millis());
            }
        }
    }

    pub async fn set_progress(&self, id: &str, progress: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.progress = progress.to_string();
        }
    }

    pub async fn push_screenshot(&self, id: &str, data_uri: String) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            task.screenshots.push(data_uri);
        }
    }

    /// 标记完成并附上结果
    pub async fn complete(&self, id: &str, results: serde_json::Value) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            // 已取消的任务不被完成覆盖
            if task.status == TaskStatus::Cancelled {
                return;
            }
            task.status = TaskStatus::Completed;
            task.results = results;
            task.ended_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// 标记失败并记录错误文本
    pub async fn fail(&self, id: &str, error: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(id) {
            if task.status == TaskStatus::Cancelled {
                return;
            }
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_string());
            task.ended_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    /// 协作式取消：状态立即可见，编排器在下一步边界停止推进
    pub async fn cancel(&self, id: &str) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if !task.is_finished() => {
                task.status = TaskStatus::Cancelled;
                task.ended_at = Some(chrono::Utc::now().timestamp_millis());
                true
            }
            _ => false,
        }
    }

    pub async fn is_cancelled(&self, id: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(id)
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    /// 清除全部已结束任务，返回清除条数
    pub async fn clear_finished(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !t.is_finished());
        before - tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let table = TaskTable::new(10);
        let id = table.create(TaskKind::SingleEmail, "https://x").await;

        let task = table.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Initializing);
        assert!(task.ended_at.is_none());

        table.set_status(&id, TaskStatus::Running).await;
        table.complete(&id, serde_json::json!({"ok": true})).await;

        let task = table.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_late_completion() {
        let table = TaskTable::new(10);
        let id = table.create(TaskKind::SingleEmail, "https://x").await;
        table.set_status(&id, TaskStatus::Running).await;

        assert!(table.cancel(&id).await);
        assert!(table.is_cancelled(&id).await);

        // 已发出的步骤跑完后写回：不得覆盖 cancelled
        table.complete(&id, serde_json::json!({})).await;
        table.set_status(&id, TaskStatus::Running).await;
        assert_eq!(table.get(&id).await.unwrap().status, TaskStatus::Cancelled);

        // 已结束的任务不能再取消
        assert!(!table.cancel(&id).await);
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest_finished_only() {
        let table = TaskTable::new(2);
        let a = table.create(TaskKind::SingleEmail, "a").await;
        table.fail(&a, "boom").await;
        let b = table.create(TaskKind::SingleEmail, "b").await;
        table.set_status(&b, TaskStatus::Running).await;

        let _c = table.create(TaskKind::SingleEmail, "c").await;
        assert_eq!(table.total_count().await, 2);
        assert!(table.get(&a).await.is_none(), "oldest finished evicted");
        assert!(table.get(&b).await.is_some(), "running task survives");
    }

    #[tokio::test]
    async fn test_clear_finished() {
        let table = TaskTable::new(10);
        let a = table.create(TaskKind::SingleEmail, "a").await;
        let b = table.create(TaskKind::BulkEmail, "b").await;
        table.complete(&a, serde_json::Value::Null).await;
        table.set_status(&b, TaskStatus::Running).await;

        assert_eq!(table.clear_finished().await, 1);
        assert_eq!(table.total_count().await, 1);
    }
}
