// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/config.rs - 服务配置
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

use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
  model::{DetectParams, DetectorSpec, Device, ModelError},
  registry::{ModelRegistry, RegistryError},
  task::{InferenceParams, PipelineError},
  tile::{TileConfig, TileMode},
};

const DEFAULT_LOG_FILTER: &str = "pingpu=info,tower_http=info";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("推理参数无效: {0}")]
  InvalidParams(#[from] PipelineError),
  #[error("上传大小上限必须大于 0")]
  InvalidUploadLimit,
  #[error("未配置检测模型：登记表中没有启用的模型，且未指定 --model")]
  NoModel,
  #[error("模型配置错误: {0}")]
  Model(#[from] ModelError),
  #[error("模型登记表错误: {0}")]
  Registry(#[from] RegistryError),
}

/// 推理参数默认值，服务与命令行工具共用
#[derive(Args, Debug, Clone)]
pub struct InferenceArgs {
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "PINGPU_CONF", default_value_t = 0.25, value_name = "THRESHOLD")]
  pub conf: f32,

  /// 模型输入尺寸
  #[arg(long, env = "PINGPU_IMGSZ", default_value_t = 640, value_name = "PIXELS")]
  pub imgsz: u32,

  /// 切片模式: auto, on, off
  #[arg(long, env = "PINGPU_TILE", default_value = "auto", value_name = "MODE")]
  pub tile: TileMode,

  /// 切片边长
  #[arg(long, env = "PINGPU_TILE_SIZE", default_value_t = 640, value_name = "PIXELS")]
  pub tile_size: u32,

  /// 相邻切片重叠比例 [0, 1)
  #[arg(long, env = "PINGPU_OVERLAP", default_value_t = 0.2, value_name = "RATIO")]
  pub overlap: f32,

  /// 合并去重的 IoU 阈值
  #[arg(long, env = "PINGPU_NMS_IOU", default_value_t = 0.5, value_name = "THRESHOLD")]
  pub nms_iou: f32,
}

impl InferenceArgs {
  pub fn to_params(&self, annotate: bool) -> Result<InferenceParams, ConfigError> {
    let params = InferenceParams {
      detect: DetectParams {
        conf: self.conf,
        imgsz: self.imgsz,
      },
      annotate,
      tile: TileConfig {
        mode: self.tile,
        tile_size: self.tile_size,
        overlap: self.overlap,
      },
      nms_iou: self.nms_iou,
    };
    params.validate()?;
    Ok(params)
  }
}

/// Pingpu 检测服务参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
  /// 监听地址
  #[arg(long, env = "PINGPU_BIND", default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub bind: SocketAddr,

  /// 默认检测模型，登记表中有启用模型时以登记表为准
  /// 支持格式:
  /// - onnx:///path/to/best.onnx?device=cpu&classes=car,truck
  /// - /path/to/best.onnx
  #[arg(long, env = "PINGPU_MODEL", value_name = "MODEL")]
  pub model: Option<String>,

  /// 默认推理设备: auto, cpu, cuda, cuda:N, N
  #[arg(long, env = "PINGPU_DEVICE", default_value = "auto", value_name = "DEVICE")]
  pub device: Device,

  /// 模型登记表文件
  #[arg(long, env = "PINGPU_REGISTRY", default_value = "models.json", value_name = "FILE")]
  pub registry: PathBuf,

  /// 调试模式，错误响应中包含详细信息
  #[arg(long, env = "PINGPU_DEBUG")]
  pub debug: bool,

  /// 单次请求上传大小上限 (MiB)
  #[arg(long, env = "PINGPU_MAX_UPLOAD_MB", default_value_t = 25, value_name = "MIB")]
  pub max_upload_mb: usize,

  /// 以 JSON 格式输出日志
  #[arg(long, env = "PINGPU_LOG_JSON")]
  pub log_json: bool,

  #[command(flatten)]
  pub inference: InferenceArgs,
}

/// 启动时解析一次的服务配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
  pub bind: SocketAddr,
  pub model: Option<DetectorSpec>,
  pub device: Device,
  pub registry_path: PathBuf,
  pub debug: bool,
  pub max_upload_bytes: usize,
  pub defaults: InferenceParams,
}

impl ServerArgs {
  pub fn resolve(self) -> Result<ServiceConfig, ConfigError> {
    if self.max_upload_mb == 0 {
      return Err(ConfigError::InvalidUploadLimit);
    }
    let model = self
      .model
      .as_deref()
      .map(str::parse::<DetectorSpec>)
      .transpose()?;
    let defaults = self.inference.to_params(false)?;

    Ok(ServiceConfig {
      bind: self.bind,
      model,
      device: self.device,
      registry_path: self.registry,
      debug: self.debug,
      max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
      defaults,
    })
  }
}

impl ServiceConfig {
  /// 启动时使用的模型：登记表中启用的模型优先，其次是 `--model`
  pub fn initial_spec(&self, registry: &ModelRegistry) -> Result<DetectorSpec, ConfigError> {
    if let Some(record) = registry.active() {
      info!("使用登记表中启用的模型: {}", record.name);
      return Ok(record.detector_spec()?);
    }
    self.model.clone().ok_or(ConfigError::NoModel)
  }
}

/// 初始化日志，`RUST_LOG` 未设置时使用默认过滤规则。
/// 日志写到标准错误，标准输出留给检测结果。
pub fn init_tracing(log_json: bool) {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
  let subscriber = tracing_subscriber::registry().with(filter);
  if log_json {
    subscriber
      .with(fmt::layer().json().with_writer(std::io::stderr))
      .init();
  } else {
    subscriber
      .with(fmt::layer().with_writer(std::io::stderr))
      .init();
  }
}
