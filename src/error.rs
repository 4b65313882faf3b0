//! 桥接与工作流错误类型
//!
//! 错误分五类：连接、超时、协议、动作失败、正文抽取失败。
//! 协议错误与动作失败会被转换为 `{success: false, error}` 信封返回给调用方，
//! 不会让分发循环崩溃；连接错误与超时只中止当前任务步骤，记录到 Task 上。

use thiserror::Error;

/// 桥接运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum Error {
    /// 对端不可达或连接已断开
    #[error("Connection error: {0}")]
    Connection(String),

    /// 动作或生成调用在超时窗口内未收到响应
    #[error("Timeout after {0}s waiting for {1}")]
    Timeout(u64, String),

    /// JSON 不合法或缺少必需参数
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 处理器已执行但报告失败（如元素不存在）
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// 所有抽取启发式都未命中
    #[error("Extraction failed: {0}")]
    Extraction(String),
}

pub type Result<T> = std::result::Result<T, Error>;
