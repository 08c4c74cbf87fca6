// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/task.rs - 平铺推理流水线
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

use std::{io::Cursor, time::Instant};

use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage, imageops};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  merge::nms_classwise,
  model::{DetectParams, Detector, ModelError},
  output::{ImageSize, InferenceResult},
  tile::{TileConfig, TileError, TilePlan},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("输入无效: {0}")]
  InvalidInput(String),
  #[error("图像解码失败: {0}")]
  Decode(#[from] image::ImageError),
  #[error("参数无效: {0}")]
  InvalidParams(String),
  #[error("切片参数无效: {0}")]
  Tile(#[from] TileError),
  #[error("检测器调用失败: {0}")]
  Detector(#[from] ModelError),
}

impl PipelineError {
  /// 由请求内容引起的错误，而不是检测器故障
  pub fn is_client_error(&self) -> bool {
    !matches!(self, PipelineError::Detector(_))
  }
}

/// 一次推理请求的全部参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
  pub detect: DetectParams,
  pub annotate: bool,
  pub tile: TileConfig,
  pub nms_iou: f32,
}

impl Default for InferenceParams {
  fn default() -> Self {
    Self {
      detect: DetectParams::default(),
      annotate: false,
      tile: TileConfig::default(),
      nms_iou: 0.5,
    }
  }
}

impl InferenceParams {
  pub fn validate(&self) -> Result<(), PipelineError> {
    let conf = self.detect.conf;
    if !conf.is_finite() || !(0.0..=1.0).contains(&conf) {
      return Err(PipelineError::InvalidParams(format!(
        "conf 必须位于 [0, 1] 区间内, 实际为 {}",
        conf
      )));
    }
    if self.detect.imgsz == 0 {
      return Err(PipelineError::InvalidParams("imgsz 必须大于 0".to_string()));
    }
    if !self.nms_iou.is_finite() || self.nms_iou < 0.0 {
      return Err(PipelineError::InvalidParams(format!(
        "nms_iou 必须为非负数, 实际为 {}",
        self.nms_iou
      )));
    }
    self.tile.validate()?;
    Ok(())
  }
}

/// 解码上传的图像字节：应用 EXIF 方向后转换为 RGB。
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
  if bytes.is_empty() {
    return Err(PipelineError::InvalidInput("图像内容为空".to_string()));
  }
  let reader = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| PipelineError::InvalidInput(format!("无法识别图像格式: {}", e)))?;
  let mut decoder = reader.into_decoder()?;
  let orientation = decoder.orientation()?;
  let mut image = DynamicImage::from_decoder(decoder)?;
  image.apply_orientation(orientation);
  let image = image.to_rgb8();
  debug!("图像解码完成: {}x{}", image.width(), image.height());
  Ok(image)
}

/// 对整张图像执行平铺推理。
///
/// 按调度顺序逐个切片调用检测器，把局部坐标平移到整图坐标，
/// 再做按类别 NMS 去重后打包。任一切片失败则整张图像失败。
/// 计时覆盖切片、检测、合并与标注绘制，不含图像编码。
pub fn run_tiled_inference(
  image: &RgbImage,
  detector: &dyn Detector,
  params: &InferenceParams,
) -> Result<InferenceResult, PipelineError> {
  params.validate()?;
  let (width, height) = image.dimensions();

  let start = Instant::now();
  let plan = TilePlan::schedule(width, height, &params.tile)?;
  info!(
    "开始推理: 图像 {}x{}, 检测器 {}, 切片数 {}",
    width,
    height,
    detector.name(),
    plan.tiles.len()
  );

  let mut detections = Vec::new();
  for (i, tile) in plan.tiles.iter().enumerate() {
    let local = if tile.is_full_image(width, height) {
      detector.detect(image, &params.detect)?
    } else {
      let region =
        imageops::crop_imm(image, tile.left, tile.top, tile.width(), tile.height()).to_image();
      detector.detect(&region, &params.detect)?
    };
    debug!("切片 {} {:?}: {} 个检测结果", i, tile, local.len());
    detections.extend(local.into_iter().map(|d| tile.to_global(d)));
  }

  let detections = nms_classwise(detections, params.nms_iou);
  let annotated = annotate(image, &detections, params.annotate);
  let elapsed = start.elapsed();
  info!(
    "推理完成: {} 个检测结果，耗时: {:.2?}",
    detections.len(),
    elapsed
  );

  Ok(InferenceResult::package(
    &detections,
    ImageSize { width, height },
    elapsed,
    annotated.as_ref(),
  ))
}

/// 解码后执行平铺推理
pub fn run_on_bytes(
  bytes: &[u8],
  detector: &dyn Detector,
  params: &InferenceParams,
) -> Result<InferenceResult, PipelineError> {
  let image = decode_image(bytes)?;
  run_tiled_inference(&image, detector, params)
}

#[cfg(feature = "annotate")]
fn annotate(
  image: &RgbImage,
  detections: &[crate::model::Detection],
  enabled: bool,
) -> Option<RgbImage> {
  if !enabled {
    return None;
  }
  let mut canvas = image.clone();
  crate::output::draw::Draw::default().draw_detections(&mut canvas, detections);
  Some(canvas)
}

#[cfg(not(feature = "annotate"))]
fn annotate(
  _image: &RgbImage,
  _detections: &[crate::model::Detection],
  enabled: bool,
) -> Option<RgbImage> {
  if enabled {
    tracing::warn!("未启用 annotate 特性，忽略标注请求");
  }
  None
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use image::Rgb;

  use super::*;
  use crate::{geometry::BBox, model::Detection, tile::TileMode};

  const RED: Rgb<u8> = Rgb([255, 0, 0]);

  /// 把区域内所有红色像素的外接框报告为一个 "0" 类目标
  #[derive(Default)]
  struct RedBlobDetector {
    calls: AtomicUsize,
  }

  impl Detector for RedBlobDetector {
    fn detect(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<Detection>, ModelError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      assert!(params.imgsz > 0);
      let mut bounds: Option<(u32, u32, u32, u32)> = None;
      for (x, y, p) in image.enumerate_pixels() {
        if *p == RED {
          bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
          });
        }
      }
      Ok(
        bounds
          .map(|(x1, y1, x2, y2)| {
            Detection::new(
              "0",
              0.9,
              BBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32),
            )
          })
          .into_iter()
          .collect(),
      )
    }

    fn name(&self) -> &str {
      "red-blob"
    }
  }

  struct FailingDetector {
    fail_on_call: usize,
    calls: AtomicUsize,
  }

  impl Detector for FailingDetector {
    fn detect(&self, _: &RgbImage, _: &DetectParams) -> Result<Vec<Detection>, ModelError> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst);
      if n == self.fail_on_call {
        Err(ModelError::Runtime("boom".to_string()))
      } else {
        Ok(vec![Detection::new("1", 0.5, BBox::new(0.0, 0.0, 4.0, 4.0))])
      }
    }

    fn name(&self) -> &str {
      "failing"
    }
  }

  fn image_with_blob(width: u32, height: u32, blob: (u32, u32, u32, u32)) -> RgbImage {
    let (bx1, by1, bx2, by2) = blob;
    RgbImage::from_fn(width, height, |x, y| {
      if (bx1..bx2).contains(&x) && (by1..by2).contains(&y) {
        RED
      } else {
        Rgb([40, 40, 40])
      }
    })
  }

  #[test]
  fn object_in_tile_overlap_is_reported_once() {
    // 步长 512，x 位于 [540, 600) 的目标同时完整出现在前两个切片中
    let image = image_with_blob(1000, 1000, (540, 100, 600, 160));
    let detector = RedBlobDetector::default();
    let result = run_tiled_inference(&image, &detector, &InferenceParams::default()).unwrap();

    assert_eq!(detector.calls.load(Ordering::SeqCst), 4);
    assert_eq!(result.total, 1);
    assert_eq!(result.counts.get("0"), Some(&1));
    let b = &result.detections[0].bbox;
    assert_eq!((b.x1, b.y1, b.x2, b.y2), (540.0, 100.0, 600.0, 160.0));
    assert_eq!((b.width, b.height), (60.0, 60.0));
    assert_eq!(result.image.width, 1000);
  }

  #[test]
  fn disabling_merge_keeps_per_tile_duplicates() {
    let image = image_with_blob(1000, 1000, (540, 100, 600, 160));
    let params = InferenceParams {
      nms_iou: 1.5,
      ..Default::default()
    };
    let result = run_tiled_inference(&image, &RedBlobDetector::default(), &params).unwrap();
    assert_eq!(result.total, 2);
  }

  #[test]
  fn small_image_runs_detector_once_on_full_frame() {
    let image = image_with_blob(320, 200, (10, 20, 30, 40));
    let detector = RedBlobDetector::default();
    let result = run_tiled_inference(&image, &detector, &InferenceParams::default()).unwrap();
    assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.detections[0].bbox.x1, 10.0);
    assert_eq!(result.detections[0].bbox.y2, 40.0);
    assert_eq!((result.image.width, result.image.height), (320, 200));
  }

  #[test]
  fn tile_failure_fails_the_whole_image() {
    let image = RgbImage::new(1000, 1000);
    let detector = FailingDetector {
      fail_on_call: 2,
      calls: AtomicUsize::new(0),
    };
    let err = run_tiled_inference(&image, &detector, &InferenceParams::default()).unwrap_err();
    assert!(matches!(err, PipelineError::Detector(_)));
    assert!(!err.is_client_error());
    assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn rejects_invalid_params_before_detecting() {
    let image = RgbImage::new(10, 10);
    let detector = RedBlobDetector::default();
    let mut params = InferenceParams::default();
    params.tile = TileConfig {
      mode: TileMode::On,
      tile_size: 0,
      overlap: 0.2,
    };
    let err = run_tiled_inference(&image, &detector, &params).unwrap_err();
    assert!(matches!(err, PipelineError::Tile(TileError::InvalidTileSize)));

    let mut params = InferenceParams::default();
    params.detect.conf = 1.5;
    assert!(matches!(
      run_tiled_inference(&image, &detector, &params),
      Err(PipelineError::InvalidParams(_))
    ));
    assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
  }

  #[cfg(feature = "annotate")]
  #[test]
  fn annotation_is_embedded_when_requested() {
    let image = image_with_blob(64, 48, (8, 8, 24, 24));
    let params = InferenceParams {
      annotate: true,
      ..Default::default()
    };
    let result = run_tiled_inference(&image, &RedBlobDetector::default(), &params).unwrap();
    assert!(result.image_b64.is_some());

    let plain =
      run_tiled_inference(&image, &RedBlobDetector::default(), &InferenceParams::default())
        .unwrap();
    assert!(plain.image_b64.is_none());
  }

  #[test]
  fn decodes_png_bytes() {
    let image = image_with_blob(12, 7, (1, 1, 3, 3));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, image::ImageFormat::Png).unwrap();
    let decoded = decode_image(bytes.get_ref()).unwrap();
    assert_eq!(decoded, image);

    let result = run_on_bytes(bytes.get_ref(), &RedBlobDetector::default(), &InferenceParams::default())
      .unwrap();
    assert_eq!(result.total, 1);
  }

  #[test]
  fn rejects_empty_and_garbage_bytes() {
    let err = decode_image(&[]).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert!(err.is_client_error());
    assert!(decode_image(b"definitely not an image").is_err());
  }
}
