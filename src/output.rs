// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/output.rs - 检测结果打包
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

use std::{collections::BTreeMap, io::Cursor, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{geometry::BBox, model::Detection};

#[cfg(feature = "annotate")]
pub mod draw;

const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("图像编码错误: {0}")]
  EncodeError(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
  pub width: u32,
  pub height: u32,
}

/// 展开后的边界框，宽高总是由角点重新计算
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub width: f32,
  pub height: f32,
}

impl From<&BBox> for BoxRecord {
  fn from(b: &BBox) -> Self {
    BoxRecord {
      x1: b.x1,
      y1: b.y1,
      x2: b.x2,
      y2: b.y2,
      width: b.width(),
      height: b.height(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
  pub class_name: String,
  pub confidence: f32,
  pub bbox: BoxRecord,
}

impl From<&Detection> for DetectionRecord {
  fn from(d: &Detection) -> Self {
    DetectionRecord {
      class_name: d.class_name.clone(),
      confidence: d.confidence,
      bbox: BoxRecord::from(&d.bbox),
    }
  }
}

pub type ClassCounts = BTreeMap<String, usize>;

/// 一张图像的最终检测结果，构建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
  pub image: ImageSize,
  pub inference_ms: u64,
  pub detections: Vec<DetectionRecord>,
  pub counts: ClassCounts,
  pub total: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_b64: Option<String>,
}

impl InferenceResult {
  /// 由去重后的整图检测结果打包。
  /// 标注图编码失败时只省略 `image_b64`，不影响其余字段。
  pub fn package(
    detections: &[Detection],
    size: ImageSize,
    elapsed: Duration,
    annotated: Option<&RgbImage>,
  ) -> Self {
    let mut counts = ClassCounts::new();
    let records = detections
      .iter()
      .map(|d| {
        *counts.entry(d.class_name.clone()).or_insert(0) += 1;
        DetectionRecord::from(d)
      })
      .collect();
    let total = counts.values().sum();

    let image_b64 = annotated.and_then(|image| match encode_jpeg_base64(image) {
      Ok(encoded) => Some(encoded),
      Err(e) => {
        warn!("标注图像编码失败，结果中省略标注图: {}", e);
        None
      }
    });

    InferenceResult {
      image: size,
      inference_ms: elapsed.as_millis() as u64,
      detections: records,
      counts,
      total,
      image_b64,
    }
  }
}

/// 把 `src` 中的计数累加进 `dst`
pub fn merge_counts<'a>(dst: &'a mut ClassCounts, src: &ClassCounts) -> &'a mut ClassCounts {
  for (class_name, n) in src {
    *dst.entry(class_name.clone()).or_insert(0) += n;
  }
  dst
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, OutputError> {
  let mut buf = Cursor::new(Vec::new());
  JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(image)?;
  let bytes = buf.into_inner();
  debug!("标注图像编码完成: {} 字节", bytes.len());
  Ok(bytes)
}

pub fn encode_jpeg_base64(image: &RgbImage) -> Result<String, OutputError> {
  Ok(STANDARD.encode(encode_jpeg(image)?))
}
