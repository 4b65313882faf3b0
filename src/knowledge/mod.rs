//! 招生知识库
//!
//! 条目化的知识片段（id / 标题 / 正文），JSON 文件持久化，供起草回信时检索。
//! 每次增删改后都执行一次 resync，重建提供给检索的 markdown 快照。
//! 检索为简单的关键词重叠打分，取前 top_k 条。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 知识片段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub content: String,
}

/// 创建请求体
#[derive(Debug, Clone, Deserialize)]
pub struct SectionCreate {
    pub title: String,
    pub content: String,
}

/// 部分更新请求体
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectionUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
}

fn default_sections() -> Vec<Section> {
    vec![
        Section {
            id: "kb-1".to_string(),
            title: "Application Status".to_string(),
            content: "We have received all of your documents. Your application is under \
                      [Pending Initial review/Pending Document Verification]."
                .to_string(),
        },
        Section {
            id: "kb-2".to_string(),
            title: "Deposit Refund Policy".to_string(),
            content: "The deposit is a non-refundable payment unless you were denied your visa. \
                      If you were denied your visa you may share the 221G slip and request a \
                      refund. For further details, please contact Mr. Neal E Jeffery - \
                      njeffery@iit.edu / 312-567-5053."
                .to_string(),
        },
        Section {
            id: "kb-3".to_string(),
            title: "TOEFL/IELTS Requirement".to_string(),
            content: "All international students are required to submit TOEFL/IELTS test scores. \
                      If you have a 2-year degree from the United States or if you are from a \
                      TOEFL/IELTS waiver-eligible country, then we may waive this requirement."
                .to_string(),
        },
    ]
}

struct Inner {
    sections: Vec<Section>,
    /// resync 产物：检索与提示词使用的 markdown 快照
    snapshot: String,
}

/// 知识库存储
pub struct KnowledgeStore {
    path: PathBuf,
    top_k: usize,
    inner: RwLock<Inner>,
}

impl KnowledgeStore {
    /// 打开（或初始化）知识库文件并构建首个快照
    pub fn open(path: impl AsRef<Path>, top_k: usize) -> Result<Arc<Self>, String> {
        let path = path.as_ref().to_path_buf();
        let sections = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read knowledge base: {}", e))?;
            serde_json::from_str(&raw)
                .map_err(|e| format!("Failed to parse knowledge base: {}", e))?
        } else {
            let seed = default_sections();
            write_file(&path, &seed)?;
            seed
        };

        let snapshot = render_snapshot(&sections);
        Ok(Arc::new(Self {
            path,
            top_k: top_k.max(1),
            inner: RwLock::new(Inner { sections, snapshot }),
        }))
    }

    pub async fn list(&self) -> Vec<Section> {
        self.inner.read().await.sections.clone()
    }

    pub async fn create(&self, req: SectionCreate) -> Result<Section, String> {
        let mut inner = self.inner.write().await;
        // 删除过条目时 len+1 会撞号，这里取最大序号 +1
        let next = inner
            .sections
            .iter()
            .filter_map(|s| s.id.strip_prefix("kb-").and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0)
            + 1;
        let section = Section {
            id: format!("kb-{}", next),
            title: req.title,
            content: req.content,
        };
        inner.sections.push(section.clone());
        write_file(&self.path, &inner.sections)?;
        inner.snapshot = render_snapshot(&inner.sections);
        Ok(section)
    }

    /// 部分更新；未找到返回 Ok(None)
    pub async fn update(&self, id: &str, req: SectionUpdate) -> Result<Option<Section>, String> {
        let mut inner = self.inner.write().await;
        let Some(section) = inner.sections.iter_mut().find(|s| s.id == id) else {
            return Ok(None);
        };
        if let Some(title) = req.title {
            section.title = title;
        }
        if let Some(content) = req.content {
            section.content = content;
        }
        let updated = section.clone();
        write_file(&self.path, &inner.sections)?;
        inner.snapshot = render_snapshot(&inner.sections);
        Ok(Some(updated))
    }

    /// 删除；返回是否确有此条目
    pub async fn delete(&self, id: &str) -> Result<bool, String> {
        let mut inner = self.inner.write().await;
        let before = inner.sections.len();
        inner.sections.retain(|s| s.id != id);
        if inner.sections.len() == before {
            return Ok(false);
        }
        write_file(&self.path, &inner.sections)?;
        inner.snapshot = render_snapshot(&inner.sections);
        Ok(true)
    }

    /// 重建检索快照（增删改后自动执行，也可显式触发）
    pub async fn resync(&self) {
        let mut inner = self.inner.write().await;
        inner.snapshot = render_snapshot(&inner.sections);
        tracing::info!("Knowledge snapshot rebuilt ({} sections)", inner.sections.len());
    }

    pub async fn snapshot(&self) -> String {
        self.inner.read().await.snapshot.clone()
    }

    /// 按关键词重叠返回最相关的片段
    pub async fn query(&self, text: &str) -> Vec<Section> {
        let words: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= 3)
            .map(String::from)
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read().await;
        let mut scored: Vec<(usize, &Section)> = inner
            .sections
            .iter()
            .map(|s| {
                let title = s.title.to_lowercase();
                let content = s.content.to_lowercase();
                let score = words
                    .iter()
                    .map(|w| {
                        let t = if title.contains(w.as_str()) { 2 } else { 0 };
                        let c = if content.contains(w.as_str()) { 1 } else { 0 };
                        t + c
                    })
                    .sum();
                (score, s)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

fn render_snapshot(sections: &[Section]) -> String {
    let mut out =
        String::from("# Illinois Institute of Technology Graduate Admissions Knowledge Base\n\n");
    for section in sections {
        out.push_str(&format!("### {}\n{}\n\n", section.title, section.content));
    }
    out
}

fn write_file(path: &Path, sections: &[Section]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create knowledge dir: {}", e))?;
    }
    let raw = serde_json::to_string_pretty(sections)
        .map_err(|e| format!("Failed to serialize knowledge base: {}", e))?;
    std::fs::write(path, raw).map_err(|e| format!("Failed to write knowledge base: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Arc<KnowledgeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::open(dir.path().join("kb.json"), 3).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_seeds_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        {
            let store = KnowledgeStore::open(&path, 3).unwrap();
            assert_eq!(store.list().await.len(), 3);
        }
        // 重新打开读到同样内容
        let store = KnowledgeStore::open(&path, 3).unwrap();
        assert_eq!(store.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_crud_and_snapshot_resync() {
        let (_dir, store) = temp_store();

        let created = store
            .create(SectionCreate {
                title: "Housing".to_string(),
                content: "On-campus housing applications open in March.".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.id, "kb-4");
        assert!(store.snapshot().await.contains("### Housing"));

        store
            .update(
                &created.id,
                SectionUpdate {
                    title: Some("Student Housing".to_string()),
                    content: None,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(store.snapshot().await.contains("### Student Housing"));

        assert!(store.delete(&created.id).await.unwrap());
        assert!(!store.snapshot().await.contains("Student Housing"));
        assert!(!store.delete("kb-999").await.unwrap());
    }

    #[tokio::test]
    async fn test_id_does_not_collide_after_delete() {
        let (_dir, store) = temp_store();
        store.delete("kb-2").await.unwrap();
        let created = store
            .create(SectionCreate {
                title: "T".to_string(),
                content: "C".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.id, "kb-4");
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let (_dir, store) = temp_store();
        let hits = store.query("Do I need to take the TOEFL test?").await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "kb-3");

        assert!(store.query("!!!").await.is_empty());
    }
}
