//! 回复生成器抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ReplyGenerator：给定提示词与独立超时，
//! 返回草稿文本。生成失败或超时时，编排器以致歉占位串顶替并继续。

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// 生成失败时编排器采用的占位回复
pub const APOLOGY_FALLBACK: &str =
    "I apologize, but I'm unable to generate a response at this time. Please try again later.";

/// 回复生成器：生成调用的超时独立于桥接动作超时
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String>;
}
