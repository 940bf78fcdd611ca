//! dana-server 启动入口
//!
//! 加载配置（config/default.toml + DANA__* 环境变量），初始化 tracing，
//! 组装 LLM 客户端与会话管理器，启动 axum 服务。

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dana::config::load_config;
use dana::llm::OpenAiClient;
use dana::server;
use dana::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let config = load_config(None)?;
    std::fs::create_dir_all(&config.server.upload_dir)?;

    let llm = Arc::new(OpenAiClient::new(&config.llm));
    let port = config.server.port;
    let manager = Arc::new(SessionManager::with_default_tools(config, llm));
    manager.spawn_reclaim_loop();

    let app = server::router(manager);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("dana server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
