// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/server/handlers.rs - HTTP 请求处理
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

use std::str::FromStr;

use axum::{
  Json,
  body::Bytes,
  extract::{Multipart, Path, Query, State},
  http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{
  AppState,
  error::{ApiError, ApiResult, INFERENCE_FAILED_MESSAGE, NO_IMAGE_MESSAGE, NO_IMAGES_MESSAGE},
};
use crate::{
  output::{ClassCounts, InferenceResult, merge_counts},
  registry::ModelRecord,
  task::{InferenceParams, PipelineError, run_on_bytes},
  tile::TileMode,
};

/// 检测接口的查询参数，未给出的使用服务默认值
#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
  pub conf: Option<String>,
  pub imgsz: Option<String>,
  pub annotate: Option<String>,
  pub tile: Option<String>,
  pub tile_size: Option<String>,
  pub overlap: Option<String>,
  pub nms_iou: Option<String>,
}

fn parse_param<T: FromStr>(name: &str, value: &Option<String>, default: T) -> ApiResult<T> {
  match value.as_deref().map(str::trim) {
    None | Some("") => Ok(default),
    Some(v) => v.parse().map_err(|_| ApiError::invalid_param(name, v)),
  }
}

fn parse_flag(name: &str, value: &Option<String>, default: bool) -> ApiResult<bool> {
  match value.as_deref().map(|v| v.trim().to_lowercase()) {
    None => Ok(default),
    Some(v) => match v.as_str() {
      "" => Ok(default),
      "1" | "true" | "yes" | "on" => Ok(true),
      "0" | "false" | "no" | "off" => Ok(false),
      _ => Err(ApiError::invalid_param(name, &v)),
    },
  }
}

impl DetectQuery {
  pub fn to_params(&self, defaults: &InferenceParams) -> ApiResult<InferenceParams> {
    let mut params = *defaults;
    params.detect.conf = parse_param("conf", &self.conf, defaults.detect.conf)?;
    params.detect.imgsz = parse_param("imgsz", &self.imgsz, defaults.detect.imgsz)?;
    params.annotate = parse_flag("annotate", &self.annotate, defaults.annotate)?;
    params.tile.mode = parse_param::<TileMode>("tile", &self.tile, defaults.tile.mode)?;
    params.tile.tile_size = parse_param("tile_size", &self.tile_size, defaults.tile.tile_size)?;
    params.tile.overlap = parse_param("overlap", &self.overlap, defaults.tile.overlap)?;
    params.nms_iou = parse_param("nms_iou", &self.nms_iou, defaults.nms_iou)?;
    params.validate().map_err(|e| ApiError::from_pipeline(e, true))?;
    Ok(params)
  }
}

struct Upload {
  filename: Option<String>,
  bytes: Bytes,
}

async fn read_uploads(multipart: &mut Multipart, names: &[&str]) -> ApiResult<Vec<Upload>> {
  let mut uploads = Vec::new();
  while let Some(field) = multipart.next_field().await? {
    if !field.name().is_some_and(|n| names.contains(&n)) {
      continue;
    }
    let filename = field.file_name().map(str::to_string);
    let bytes = field.bytes().await?;
    uploads.push(Upload { filename, bytes });
  }
  Ok(uploads)
}

pub async fn health() -> Json<Value> {
  Json(json!({ "status": "ok" }))
}

/// POST /api/detect/
pub async fn detect(
  State(state): State<AppState>,
  Query(query): Query<DetectQuery>,
  mut multipart: Multipart,
) -> ApiResult<Json<InferenceResult>> {
  let params = query.to_params(&state.settings.defaults)?;
  let upload = read_uploads(&mut multipart, &["image"])
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| ApiError::bad_request(NO_IMAGE_MESSAGE))?;

  let provider = state.provider().await;
  let result = tokio::task::spawn_blocking(move || {
    run_on_bytes(&upload.bytes, provider.detector(), &params)
  })
  .await
  .map_err(|e| ApiError::internal(format!("inference task failed: {e}")))?
  .map_err(|e| ApiError::from_pipeline(e, state.settings.debug))?;

  Ok(Json(result))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchEntry {
  pub filename: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<InferenceResult>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
  pub results: Vec<BatchEntry>,
  pub counts: ClassCounts,
  pub total: usize,
  pub processed: usize,
  pub failed: usize,
}

fn batch_error_message(err: &PipelineError, debug: bool) -> String {
  if err.is_client_error() || debug {
    err.to_string()
  } else {
    INFERENCE_FAILED_MESSAGE.to_string()
  }
}

/// POST /api/detect/batch/
///
/// 逐张处理，单张失败只记录在对应条目中
pub async fn detect_batch(
  State(state): State<AppState>,
  Query(query): Query<DetectQuery>,
  mut multipart: Multipart,
) -> ApiResult<Json<BatchResponse>> {
  let params = query.to_params(&state.settings.defaults)?;
  let uploads = read_uploads(&mut multipart, &["images", "image"]).await?;
  if uploads.is_empty() {
    return Err(ApiError::bad_request(NO_IMAGES_MESSAGE));
  }

  let provider = state.provider().await;
  let debug = state.settings.debug;
  let response = tokio::task::spawn_blocking(move || {
    let mut counts = ClassCounts::new();
    let mut results = Vec::with_capacity(uploads.len());
    let mut failed = 0;
    for upload in uploads {
      match run_on_bytes(&upload.bytes, provider.detector(), &params) {
        Ok(result) => {
          merge_counts(&mut counts, &result.counts);
          results.push(BatchEntry {
            filename: upload.filename,
            result: Some(result),
            error: None,
          });
        }
        Err(e) => {
          warn!("批量检测中图像 {:?} 处理失败: {}", upload.filename, e);
          failed += 1;
          results.push(BatchEntry {
            filename: upload.filename,
            result: None,
            error: Some(batch_error_message(&e, debug)),
          });
        }
      }
    }
    let total = counts.values().sum();
    BatchResponse {
      processed: results.len() - failed,
      results,
      counts,
      total,
      failed,
    }
  })
  .await
  .map_err(|e| ApiError::internal(format!("inference task failed: {e}")))?;

  info!(
    "批量检测完成: 成功 {}，失败 {}",
    response.processed, response.failed
  );
  Ok(Json(response))
}

/// GET /api/models/
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelRecord>> {
  Json(state.registry.lock().await.list().to_vec())
}

/// POST /api/models/
///
/// 保存启用的记录前先加载其模型，加载失败则登记表保持不变
pub async fn create_model(
  State(state): State<AppState>,
  Json(record): Json<ModelRecord>,
) -> ApiResult<(StatusCode, Json<ModelRecord>)> {
  record.validate()?;
  let mut registry = state.registry.lock().await;
  let provider = if record.is_active {
    Some(state.load(&record).await?)
  } else {
    None
  };
  let saved = registry.upsert(record)?.clone();
  if let Some(provider) = provider {
    state.swap_provider(provider).await;
  }
  Ok((StatusCode::CREATED, Json(saved)))
}

/// POST /api/models/:name/activate
pub async fn activate_model(
  State(state): State<AppState>,
  Path(name): Path<String>,
) -> ApiResult<Json<ModelRecord>> {
  let mut registry = state.registry.lock().await;
  let record = registry
    .get(&name)
    .cloned()
    .ok_or_else(|| ApiError::NotFound(name.clone()))?;
  let provider = state.load(&record).await?;
  let activated = registry.activate(&name)?.clone();
  state.swap_provider(provider).await;
  Ok(Json(activated))
}

/// DELETE /api/models/:name
pub async fn delete_model(
  State(state): State<AppState>,
  Path(name): Path<String>,
) -> ApiResult<StatusCode> {
  state.registry.lock().await.remove(&name)?;
  Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn query(pairs: &[(&str, &str)]) -> DetectQuery {
    let mut q = DetectQuery::default();
    for (k, v) in pairs {
      let v = Some(v.to_string());
      match *k {
        "conf" => q.conf = v,
        "imgsz" => q.imgsz = v,
        "annotate" => q.annotate = v,
        "tile" => q.tile = v,
        "tile_size" => q.tile_size = v,
        "overlap" => q.overlap = v,
        "nms_iou" => q.nms_iou = v,
        _ => unreachable!(),
      }
    }
    q
  }

  #[test]
  fn empty_query_uses_defaults() {
    let defaults = InferenceParams::default();
    assert_eq!(query(&[]).to_params(&defaults).unwrap(), defaults);
  }

  #[test]
  fn query_overrides_defaults() {
    let params = query(&[
      ("conf", "0.4"),
      ("imgsz", "1280"),
      ("annotate", "YES"),
      ("tile", "0"),
      ("tile_size", "800"),
      ("overlap", "0.25"),
      ("nms_iou", "0.65"),
    ])
    .to_params(&InferenceParams::default())
    .unwrap();
    assert_eq!(params.detect.conf, 0.4);
    assert_eq!(params.detect.imgsz, 1280);
    assert!(params.annotate);
    assert_eq!(params.tile.mode, TileMode::Off);
    assert_eq!(params.tile.tile_size, 800);
    assert_eq!(params.tile.overlap, 0.25);
    assert_eq!(params.nms_iou, 0.65);
  }

  #[test]
  fn empty_values_fall_back_to_defaults() {
    let defaults = InferenceParams {
      annotate: true,
      ..InferenceParams::default()
    };
    let params = query(&[("annotate", ""), ("conf", " "), ("tile", "")])
      .to_params(&defaults)
      .unwrap();
    assert_eq!(params, defaults);
  }

  #[test]
  fn rejects_malformed_query_values() {
    let defaults = InferenceParams::default();
    for pairs in [
      [("conf", "high")],
      [("tile", "sometimes")],
      [("annotate", "maybe")],
      [("overlap", "1.0")],
      [("tile_size", "0")],
      [("nms_iou", "-0.1")],
    ] {
      let err = query(&pairs).to_params(&defaults).unwrap_err();
      assert!(
        matches!(err, ApiError::InvalidInput { .. }),
        "{pairs:?} gave {err:?}"
      );
    }
  }
}
