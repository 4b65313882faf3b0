//! Counselor - 招生邮件智能助理
//!
//! 后端通过 WebSocket 桥接驱动浏览器标签页，读取 Slate 邮件页面，
//! 结合本地知识库生成回复草稿并填入回复框（只起草，不发送）。
//!
//! 分层：
//! - **bridge**：线协议、关联追踪客户端与动作分发器
//! - **workflow**：任务表与单封 / 批量回信编排
//! - **knowledge**：JSON 文件知识库与关键词检索
//! - **llm**：回复生成（OpenAI 兼容 / mock）
//! - **api**：HTTP 控制面（提交 / 轮询 / 取消任务，维护知识库）

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod workflow;

pub use config::{load_config, AppConfig};
pub use error::{Error, Result};
