// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime YOLO 检测器
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

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array2, Array4, ArrayViewD, Axis, Ix2};
#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;
use ort::{
  execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch},
  session::{Session, builder::GraphOptimizationLevel},
  value::Value,
};
use tracing::{debug, error, info};

use crate::{
  geometry::BBox,
  merge::nms_classwise,
  model::{DetectParams, Detection, Detector, Device, ModelError},
};

const YOLO_STRIDE: u32 = 32;
const YOLO_PAD_VALUE: f32 = 114.0 / 255.0;
// 模型自身的类内 NMS 阈值与最大输出数量
const YOLO_MODEL_NMS_IOU: f32 = 0.7;
const YOLO_MAX_DETECTIONS: usize = 300;

fn runtime_error(e: impl std::fmt::Display) -> ModelError {
  error!("ONNX Runtime 错误: {}", e);
  ModelError::Runtime(e.to_string())
}

/// 模型输入尺寸向上取整到步长的倍数
pub(crate) fn check_imgsz(imgsz: u32) -> u32 {
  imgsz.max(YOLO_STRIDE).div_ceil(YOLO_STRIDE) * YOLO_STRIDE
}

pub struct OnnxYoloBuilder {
  model_path: PathBuf,
  device: Device,
  class_names: Option<Vec<String>>,
}

impl OnnxYoloBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      device: Device::Auto,
      class_names: None,
    }
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn class_names(mut self, class_names: Option<Vec<String>>) -> Self {
    self.class_names = class_names;
    self
  }

  fn execution_providers(&self) -> Result<Vec<ExecutionProviderDispatch>, ModelError> {
    match self.device {
      Device::Cpu => Ok(vec![CPUExecutionProvider::default().build()]),
      #[cfg(feature = "cuda")]
      Device::Cuda(id) => Ok(vec![
        CUDAExecutionProvider::default()
          .with_device_id(id as i32)
          .build(),
      ]),
      #[cfg(not(feature = "cuda"))]
      Device::Cuda(_) => Err(ModelError::BackendDisabled("cuda")),
      #[cfg(feature = "cuda")]
      Device::Auto => Ok(vec![
        CUDAExecutionProvider::default().build(),
        CPUExecutionProvider::default().build(),
      ]),
      #[cfg(not(feature = "cuda"))]
      Device::Auto => Ok(vec![CPUExecutionProvider::default().build()]),
    }
  }

  pub fn build(self) -> Result<OnnxYolo, ModelError> {
    if !self.model_path.exists() {
      return Err(ModelError::ModelNotFound(self.model_path));
    }

    info!("创建 ONNX Runtime 推理会话: {}", self.model_path.display());
    let session = Session::builder()
      .map_err(runtime_error)?
      .with_execution_providers(self.execution_providers()?)
      .map_err(runtime_error)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(runtime_error)?
      .commit_from_file(&self.model_path)
      .map_err(runtime_error)?;

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .unwrap_or_else(|| "images".to_string());
    debug!("模型输入名称: {}", input_name);
    info!("模型加载完成");

    let name = self
      .model_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "onnx".to_string());

    Ok(OnnxYolo {
      session: Mutex::new(session),
      input_name,
      class_names: self.class_names,
      name,
    })
  }
}

/// 缩放与填充参数，用于把模型坐标还原到输入区域坐标
#[derive(Debug, Clone, Copy)]
struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

impl Letterbox {
  fn restore(&self, cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    let x1 = ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.width);
    let y1 = ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.height);
    let x2 = ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, self.width);
    let y2 = ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, self.height);
    BBox::new(x1, y1, x2, y2)
  }
}

fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, Letterbox) {
  let (w, h) = image.dimensions();
  let scale = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
  let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
  let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;

  let mut input = Array4::<f32>::from_elem((1, 3, size as usize, size as usize), YOLO_PAD_VALUE);
  for (x, y, pixel) in resized.enumerate_pixels() {
    let (px, py) = ((x + pad_x) as usize, (y + pad_y) as usize);
    for c in 0..3 {
      input[[0, c, py, px]] = pixel[c] as f32 / 255.0;
    }
  }

  (
    input,
    Letterbox {
      scale,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
      width: w as f32,
      height: h as f32,
    },
  )
}

/// 把 [1, 4+nc, N] 或 [1, N, 4+nc] 的输出整理为 [N, 4+nc]
fn anchors_by_features(output: ArrayViewD<f32>) -> Result<Array2<f32>, ModelError> {
  let shape = output.shape().to_vec();
  if shape.len() != 3 || shape[0] != 1 {
    return Err(ModelError::InvalidOutput(format!(
      "期望输出形状为 [1, 4+nc, N] 或 [1, N, 4+nc], 实际为 {:?}",
      shape
    )));
  }

  let plane = output
    .index_axis(Axis(0), 0)
    .into_dimensionality::<Ix2>()
    .map_err(|e| ModelError::InvalidOutput(e.to_string()))?;

  let table = if shape[1] < shape[2] {
    plane.t().to_owned()
  } else {
    plane.to_owned()
  };

  if table.ncols() < 5 {
    return Err(ModelError::InvalidOutput(format!(
      "输出特征维度过小: {}",
      table.ncols()
    )));
  }
  Ok(table)
}

pub struct OnnxYolo {
  session: Mutex<Session>,
  input_name: String,
  class_names: Option<Vec<String>>,
  name: String,
}

impl OnnxYolo {
  fn label(&self, class_id: usize) -> String {
    self
      .class_names
      .as_ref()
      .and_then(|names| names.get(class_id))
      .cloned()
      .unwrap_or_else(|| class_id.to_string())
  }

  fn postprocess(&self, table: &Array2<f32>, lb: &Letterbox, conf: f32) -> Vec<Detection> {
    let mut items = Vec::new();
    for row in table.rows() {
      let (class_id, score) = row
        .iter()
        .skip(4)
        .copied()
        .enumerate()
        .fold((0usize, f32::MIN), |best, (i, s)| if s > best.1 { (i, s) } else { best });

      if score < conf {
        continue;
      }

      let bbox = lb.restore(row[0], row[1], row[2], row[3]);
      if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
        continue;
      }
      items.push(Detection::new(self.label(class_id), score, bbox));
    }
    debug!("置信度过滤后候选框数量: {}", items.len());

    let mut items = nms_classwise(items, YOLO_MODEL_NMS_IOU);
    items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    items.truncate(YOLO_MAX_DETECTIONS);
    items
  }
}

impl Detector for OnnxYolo {
  fn detect(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<Detection>, ModelError> {
    let size = check_imgsz(params.imgsz);
    debug!(
      "预处理输入区域 {}x{} -> {}x{}",
      image.width(),
      image.height(),
      size,
      size
    );
    let (input, lb) = letterbox(image, size);
    let input_value = Value::from_array(input).map_err(runtime_error)?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| ModelError::Runtime("推理会话锁已中毒".to_string()))?;

    debug!("执行模型推理");
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => input_value])
      .map_err(runtime_error)?;
    let output = outputs[0]
      .try_extract_array::<f32>()
      .map_err(runtime_error)?;
    let table = anchors_by_features(output)?;

    Ok(self.postprocess(&table, &lb, params.conf))
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array3;

  #[test]
  fn imgsz_rounds_up_to_stride() {
    assert_eq!(check_imgsz(640), 640);
    assert_eq!(check_imgsz(641), 672);
    assert_eq!(check_imgsz(1), 32);
    assert_eq!(check_imgsz(0), 32);
  }

  #[test]
  fn letterbox_pads_short_side() {
    let image = RgbImage::from_pixel(200, 100, image::Rgb([255, 0, 0]));
    let (input, lb) = letterbox(&image, 64);
    assert_eq!(input.shape(), &[1, 3, 64, 64]);
    assert_eq!(lb.scale, 0.32);
    assert_eq!(lb.pad_x, 0.0);
    assert_eq!(lb.pad_y, 16.0);
    assert_eq!(input[[0, 0, 0, 0]], YOLO_PAD_VALUE);
    assert_eq!(input[[0, 0, 32, 32]], 1.0);
    assert_eq!(input[[0, 1, 32, 32]], 0.0);
  }

  #[test]
  fn restores_letterboxed_boxes() {
    let lb = Letterbox {
      scale: 0.5,
      pad_x: 0.0,
      pad_y: 10.0,
      width: 200.0,
      height: 100.0,
    };
    let b = lb.restore(50.0, 35.0, 20.0, 10.0);
    assert_eq!(b, BBox::new(80.0, 40.0, 120.0, 60.0));
    let clipped = lb.restore(0.0, 10.0, 20.0, 20.0);
    assert_eq!(clipped, BBox::new(0.0, 0.0, 20.0, 20.0));
  }

  #[test]
  fn reorients_feature_major_output() {
    // [1, 6, 10]：4 个坐标 + 2 个类别，10 个锚点
    let raw = Array3::<f32>::from_shape_fn((1, 6, 10), |(_, f, a)| (f * 100 + a) as f32);
    let table = anchors_by_features(raw.view().into_dyn()).unwrap();
    assert_eq!(table.shape(), &[10, 6]);
    assert_eq!(table[[2, 5]], 502.0);
  }

  #[test]
  fn rejects_malformed_output() {
    let raw = Array3::<f32>::zeros((1, 3, 4));
    assert!(anchors_by_features(raw.view().into_dyn()).is_err());
    let raw = Array2::<f32>::zeros((4, 4));
    assert!(anchors_by_features(raw.view().into_dyn()).is_err());
  }
}
