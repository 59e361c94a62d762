//! Archi - 多智能体任务编排核心
//!
//! 入口：初始化日志、加载配置、装配组件并启动 REST 服务。

use anyhow::Context;
use archi::api;
use archi::config::load_config;
use archi::core::build_components;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    archi::observability::init();

    let config = load_config(None).context("Failed to load config")?;

    // 审计日志等持久化文件的根目录
    if let Some(root) = &config.app.data_root {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create data root {}", root.display()))?;
    }

    let bind = config.api.bind.clone();
    let components = build_components(config);
    let app = api::router(components.orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "Archi orchestrator listening");
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}
