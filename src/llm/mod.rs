//! 回复草稿生成（外部协作方的本地封装）

mod mock;
mod openai;
mod traits;

pub use mock::MockReplyGenerator;
pub use openai::OpenAiReplyGenerator;
pub use traits::{ReplyGenerator, APOLOGY_FALLBACK};

use std::sync::Arc;

use crate::config::LlmSection;

/// 按配置选择后端；未识别的 provider 回落到 mock
pub fn create_generator(cfg: &LlmSection) -> Arc<dyn ReplyGenerator> {
    match cfg.provider.as_str() {
        "openai" => Arc::new(OpenAiReplyGenerator::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            None,
        )),
        _ => Arc::new(MockReplyGenerator::new()),
    }
}
