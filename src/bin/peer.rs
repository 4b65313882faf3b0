//! 桥接对端入口：以 mock 浏览器跑动作分发器
//!
//! 真实部署中对端是浏览器扩展；此进程提供同一线协议的替身，
//! 便于脱离浏览器联调控制面与工作流。

use std::sync::Arc;

use counselor::bridge::{BridgeServer, MockBrowser};
use counselor::{load_config, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None)?;
    let browser = Arc::new(MockBrowser::new(cfg.bridge.max_wait_secs));
    let server = BridgeServer::new(browser);

    let addr = server.start(&cfg.bridge.bind_addr).await?;
    tracing::info!("Mock browser peer ready on ws://{}", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.stop().await;

    Ok(())
}
