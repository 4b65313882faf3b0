//! 浏览器桥接
//!
//! 后端进程通过消息传递协议驱动浏览器标签页：
//! - **protocol**：JSON 线协议（请求 / 统一结果信封 / welcome）
//! - **registry**：动作名到处理器的查找表 + 参数校验
//! - **browser**：`BrowserControl` 能力接口与 mock 实现
//! - **server**：分发器——接受连接、逐条路由、回写响应
//! - **transport**：到对端的长连接（WebSocket / 测试通道）
//! - **client**：关联追踪——请求 id 配对响应、每请求超时
//!
//! 不变量：一条连接上发出的每个请求，要么恰好消费一条匹配 id 的响应，
//! 要么超时放弃；响应绝不会被投递两次或投给错误的等待者。

mod browser;
mod client;
mod protocol;
mod registry;
mod server;
mod transport;

pub use browser::{ActionResult, BrowserControl, MockBrowser};
pub use client::BridgeClient;
pub use protocol::{
    ActionRequest, ActionResponse, BrowserTab, DomSnapshot, Highlight, HighlightCapture,
    ResultEnvelope, ServerInfo, Welcome, CAPABILITIES, PROTOCOL_VERSION, SENTINEL_ID,
};
pub use registry::{ActionKind, ActionRegistry};
pub use server::BridgeServer;
pub use transport::{ChannelTransport, FakePeer, PeerTransport, WsTransport};
