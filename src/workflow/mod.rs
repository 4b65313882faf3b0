//! 工作流层：任务表、内容抽取与编排器

pub mod extract;
pub mod orchestrator;
pub mod task;

pub use extract::{extract_email_content, find_email_elements, find_email_links, EmailElements};
pub use orchestrator::Orchestrator;
pub use task::{TaskId, TaskKind, TaskRecord, TaskStatus, TaskTable};
