// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/bin/pingpu_server.rs - 检测 HTTP 服务
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use pingpu::{
  config::{ServerArgs, init_tracing},
  registry::ModelRegistry,
  server::{AppState, ServerSettings, create_router},
};

#[tokio::main]
async fn main() -> Result<()> {
  let args = ServerArgs::parse();
  init_tracing(args.log_json);

  let config = args.resolve()?;
  info!("监听地址: {}", config.bind);
  info!("模型登记表: {}", config.registry_path.display());
  info!("默认推理设备: {}", config.device);

  let registry = ModelRegistry::open(&config.registry_path)?;
  let spec = config.initial_spec(&registry)?;
  let provider = spec
    .load(config.device)
    .with_context(|| format!("无法加载模型 {}", spec.weights.display()))?;

  let state = AppState::new(ServerSettings::from(&config), provider, registry);
  let app = create_router(state);

  let listener = tokio::net::TcpListener::bind(config.bind)
    .await
    .with_context(|| format!("无法监听 {}", config.bind))?;
  info!("服务已启动: http://{}", config.bind);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到退出信号，正在停止服务..."),
    Err(e) => {
      warn!("无法监听退出信号: {}", e);
      std::future::pending::<()>().await;
    }
  }
}
