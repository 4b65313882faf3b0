//! 控制面入口：加载配置，启动 HTTP API 与工作流编排

use std::sync::Arc;

use counselor::api::{router, AppState};
use counselor::knowledge::KnowledgeStore;
use counselor::llm::create_generator;
use counselor::workflow::{Orchestrator, TaskTable};
use counselor::{load_config, observability};

/// 任务表上限：超过后淘汰最旧的已结束任务
const MAX_TASK_ENTRIES: usize = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None)?;
    if let Some(name) = &cfg.app.name {
        tracing::info!("Starting {}", name);
    }

    let knowledge = KnowledgeStore::open(&cfg.knowledge.path, cfg.knowledge.top_k)
        .map_err(|e| anyhow::anyhow!(e))?;
    let table = TaskTable::new(MAX_TASK_ENTRIES);
    let generator = create_generator(&cfg.llm);
    let orchestrator = Orchestrator::new(
        &cfg,
        Arc::clone(&table),
        Arc::clone(&generator),
        Arc::clone(&knowledge),
    );

    let state = AppState {
        orchestrator,
        table,
        knowledge,
        generator,
        llm_timeout: std::time::Duration::from_secs(cfg.llm.generation_timeout_secs),
        bridge: cfg.bridge.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&cfg.app.api_bind).await?;
    tracing::info!("Control API listening on http://{}", cfg.app.api_bind);
    tracing::info!("Bridge peer expected at {}", cfg.bridge.peer_url);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
