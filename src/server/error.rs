// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/server/error.rs - HTTP 错误响应
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

use axum::{
  Json,
  extract::multipart::MultipartError,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::{registry::RegistryError, task::PipelineError};

pub type ApiResult<T> = Result<T, ApiError>;

pub const NO_IMAGE_MESSAGE: &str = "No image uploaded. Use form field name \"image\".";
pub const NO_IMAGES_MESSAGE: &str = "No images uploaded. Use form field name \"images\".";
pub const INFERENCE_FAILED_MESSAGE: &str = "Model inference failed";

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),

  #[error("{error}: {detail}")]
  InvalidInput { error: &'static str, detail: String },

  #[error("{0}")]
  PayloadTooLarge(String),

  #[error("Model inference failed")]
  Inference { detail: Option<String> },

  #[error("Model not found: {0}")]
  NotFound(String),

  #[error("{0}")]
  Conflict(String),

  #[error("Internal error: {0}")]
  Internal(String),
}

impl ApiError {
  pub fn bad_request(msg: impl Into<String>) -> Self {
    Self::BadRequest(msg.into())
  }

  pub fn invalid_param(name: &str, value: &str) -> Self {
    Self::InvalidInput {
      error: "Invalid parameter",
      detail: format!("{name}={value}"),
    }
  }

  pub fn internal(msg: impl Into<String>) -> Self {
    Self::Internal(msg.into())
  }

  /// 检测器故障的细节只在调试模式下返回给客户端
  pub fn from_pipeline(err: PipelineError, debug: bool) -> Self {
    if err.is_client_error() {
      let error = match err {
        PipelineError::InvalidInput(_) | PipelineError::Decode(_) => "Invalid image",
        _ => "Invalid parameters",
      };
      Self::InvalidInput {
        error,
        detail: err.to_string(),
      }
    } else {
      error!("推理失败: {}", err);
      Self::Inference {
        detail: debug.then(|| err.to_string()),
      }
    }
  }

  fn status_code(&self) -> StatusCode {
    match self {
      ApiError::BadRequest(_) | ApiError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
      ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
      ApiError::NotFound(_) => StatusCode::NOT_FOUND,
      ApiError::Conflict(_) => StatusCode::CONFLICT,
      ApiError::Inference { .. } | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  fn body(&self) -> ErrorResponse {
    match self {
      ApiError::InvalidInput { error, detail } => ErrorResponse {
        error: error.to_string(),
        detail: Some(detail.clone()),
      },
      ApiError::Inference { detail } => ErrorResponse {
        error: INFERENCE_FAILED_MESSAGE.to_string(),
        detail: detail.clone(),
      },
      _ => ErrorResponse {
        error: self.to_string(),
        detail: None,
      },
    }
  }
}

impl From<MultipartError> for ApiError {
  fn from(err: MultipartError) -> Self {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
      ApiError::PayloadTooLarge(err.body_text())
    } else {
      ApiError::BadRequest(format!("Multipart error: {}", err.body_text()))
    }
  }
}

impl From<RegistryError> for ApiError {
  fn from(err: RegistryError) -> Self {
    match err {
      RegistryError::NotFound(name) => ApiError::NotFound(name),
      RegistryError::ActiveModel(name) => {
        ApiError::Conflict(format!("Cannot delete the active model: {name}"))
      }
      RegistryError::DeactivateActive(name) => ApiError::Conflict(format!(
        "Cannot deactivate the active model: {name}; activate another model first"
      )),
      RegistryError::InvalidRecord(msg) => ApiError::BadRequest(msg),
      other => {
        error!("模型登记表错误: {}", other);
        ApiError::Internal(other.to_string())
      }
    }
  }
}

#[derive(Serialize)]
struct ErrorResponse {
  error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  detail: Option<String>,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status_code(), Json(self.body())).into_response()
  }
}
