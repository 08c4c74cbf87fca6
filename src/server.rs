// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::sync::Arc;

use axum::{
  Router,
  extract::DefaultBodyLimit,
  routing::{delete, get, post},
};
use tokio::sync::{Mutex, RwLock};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
  config::ServiceConfig,
  model::{DetectorProvider, DetectorSpec, Device, ModelError},
  registry::{ModelRecord, ModelRegistry},
  task::InferenceParams,
};

pub mod error;
pub mod handlers;

pub use self::error::{ApiError, ApiResult};

/// 根据模型规格构建检测器提供者
pub trait ModelLoader: Send + Sync {
  fn load(&self, spec: &DetectorSpec, default_device: Device) -> Result<DetectorProvider, ModelError>;
}

/// 使用规格中声明的后端加载模型
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecLoader;

impl ModelLoader for SpecLoader {
  fn load(&self, spec: &DetectorSpec, default_device: Device) -> Result<DetectorProvider, ModelError> {
    spec.load(default_device)
  }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
  pub defaults: InferenceParams,
  pub debug: bool,
  pub device: Device,
  pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
  fn default() -> Self {
    Self {
      defaults: InferenceParams::default(),
      debug: false,
      device: Device::Auto,
      max_upload_bytes: 25 * 1024 * 1024,
    }
  }
}

impl From<&ServiceConfig> for ServerSettings {
  fn from(config: &ServiceConfig) -> Self {
    Self {
      defaults: config.defaults,
      debug: config.debug,
      device: config.device,
      max_upload_bytes: config.max_upload_bytes,
    }
  }
}

/// 共享的服务状态。检测器提供者整体替换，
/// 进行中的请求继续使用它开始时拿到的提供者。
#[derive(Clone)]
pub struct AppState {
  pub settings: Arc<ServerSettings>,
  provider: Arc<RwLock<DetectorProvider>>,
  registry: Arc<Mutex<ModelRegistry>>,
  loader: Arc<dyn ModelLoader>,
}

impl AppState {
  pub fn new(settings: ServerSettings, provider: DetectorProvider, registry: ModelRegistry) -> Self {
    Self {
      settings: Arc::new(settings),
      provider: Arc::new(RwLock::new(provider)),
      registry: Arc::new(Mutex::new(registry)),
      loader: Arc::new(SpecLoader),
    }
  }

  pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
    self.loader = loader;
    self
  }

  pub async fn provider(&self) -> DetectorProvider {
    self.provider.read().await.clone()
  }

  async fn swap_provider(&self, provider: DetectorProvider) {
    info!("切换检测模型: {:?}", provider);
    *self.provider.write().await = provider;
  }

  // 模型加载较慢，放到阻塞线程池中执行
  async fn load(&self, record: &ModelRecord) -> ApiResult<DetectorProvider> {
    let spec = record.detector_spec().map_err(|e| load_failed(&record.name, e))?;
    let loader = self.loader.clone();
    let device = self.settings.device;
    tokio::task::spawn_blocking(move || loader.load(&spec, device))
      .await
      .map_err(|e| ApiError::internal(format!("model loading task failed: {e}")))?
      .map_err(|e| load_failed(&record.name, e))
  }
}

fn load_failed(name: &str, err: ModelError) -> ApiError {
  warn!("模型 {} 加载失败: {}", name, err);
  ApiError::InvalidInput {
    error: "Model could not be loaded",
    detail: err.to_string(),
  }
}

pub fn create_router(state: AppState) -> Router {
  let limit = state.settings.max_upload_bytes;

  let api = Router::new()
    .route("/health/", get(handlers::health))
    .route("/detect/", post(handlers::detect))
    .route("/detect/batch/", post(handlers::detect_batch))
    .route(
      "/models/",
      get(handlers::list_models).post(handlers::create_model),
    )
    .route("/models/:name/activate", post(handlers::activate_model))
    .route("/models/:name", delete(handlers::delete_model));

  Router::new()
    .nest("/api", api)
    .layer(DefaultBodyLimit::max(limit))
    .layer(RequestBodyLimitLayer::new(limit))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
