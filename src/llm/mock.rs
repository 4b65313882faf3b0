//! Mock 回复生成器（用于测试与脱机运行，无需 API）

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::llm::ReplyGenerator;

/// Mock 生成器：拼一封确定性的礼貌回信；`failing()` 变体恒定失败
#[derive(Debug, Default)]
pub struct MockReplyGenerator {
    fail: bool,
}

impl MockReplyGenerator {
    pub fn new() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl ReplyGenerator for MockReplyGenerator {
    async fn generate(&self, prompt: &str, _timeout: Duration) -> Result<String> {
        if self.fail {
            return Err(Error::ActionFailed("Mock generator failure".to_string()));
        }

        let hint: String = prompt.chars().take(80).collect();
        Ok(format!(
            "Thank you for reaching out to the Office of Graduate Admissions.\n\n\
             We have received your message regarding: {}\n\n\
             A counselor will follow up with the details you requested shortly.\n\n\
             Best regards,\nGraduate Admissions",
            hint.trim()
        ))
    }
}
