// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/model.rs - 检测模型接口与模型提供者
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
  fmt,
  path::{Path, PathBuf},
  str::FromStr,
  sync::Arc,
};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, geometry::BBox};

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::OnnxYolo;

/// 单个检测结果。检测器产生的是输入区域内的局部坐标，
/// 经过平移之后为整图坐标。
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_name: String,
  pub confidence: f32,
  pub bbox: BBox,
}

impl Detection {
  pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
    Self {
      class_name: class_name.into(),
      confidence,
      bbox,
    }
  }
}

/// 单次检测调用的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
  /// 置信度阈值
  pub conf: f32,
  /// 模型输入尺寸
  pub imgsz: u32,
}

impl Default for DetectParams {
  fn default() -> Self {
    Self {
      conf: 0.25,
      imgsz: 640,
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("不支持的权重格式: {0}")]
  UnsupportedWeights(String),
  #[error("推理后端未编译: {0}")]
  BackendDisabled(&'static str),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceParseError),
  #[error("推理运行时错误: {0}")]
  Runtime(String),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
}

/// 检测器：给定图像区域与参数，返回局部坐标下的原始检测结果。
///
/// 实现不要求可并发调用，调用方按顺序逐个切片调用。
pub trait Detector: Send + Sync {
  fn detect(&self, image: &RgbImage, params: &DetectParams) -> Result<Vec<Detection>, ModelError>;

  fn name(&self) -> &str;
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
  #[default]
  Auto,
  Cpu,
  Cuda(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("无法识别的推理设备 '{0}'，可选值: auto, cpu, cuda, cuda:N, N")]
pub struct DeviceParseError(pub String);

impl FromStr for Device {
  type Err = DeviceParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let dev = s.trim().to_lowercase();
    match dev.as_str() {
      "" | "auto" => Ok(Device::Auto),
      "cpu" => Ok(Device::Cpu),
      "cuda" | "gpu" => Ok(Device::Cuda(0)),
      _ => {
        let index = dev.strip_prefix("cuda:").unwrap_or(&dev);
        index
          .parse::<u32>()
          .map(Device::Cuda)
          .map_err(|_| DeviceParseError(s.to_string()))
      }
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Auto => write!(f, "auto"),
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(id) => write!(f, "cuda:{}", id),
    }
  }
}

/// 推理后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
  Onnx,
}

/// 描述如何构建一个检测器：后端、权重路径、设备与类别名称。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSpec {
  pub backend: Backend,
  pub weights: PathBuf,
  pub device: Option<Device>,
  pub class_names: Option<Vec<String>>,
}

impl FromUrlWithScheme for DetectorSpec {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for DetectorSpec {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案, 实际为 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| ModelError::ModelPathError(format!("模型路径解码失败: {}", e)))?;
    if path.is_empty() || path == "/" {
      return Err(ModelError::ModelPathError(format!("模型路径为空: {}", url)));
    }

    let mut device = None;
    let mut class_names = None;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "device" => device = Some(v.parse::<Device>()?),
        "classes" => {
          class_names = Some(
            v.split(',')
              .map(|s| s.trim().to_string())
              .filter(|s| !s.is_empty())
              .collect(),
          )
        }
        _ => {}
      }
    }

    Ok(DetectorSpec {
      backend: Backend::Onnx,
      weights: PathBuf::from(path.as_ref()),
      device,
      class_names,
    })
  }
}

/// 接受 `onnx://` URL 或普通权重文件路径
impl FromStr for DetectorSpec {
  type Err = ModelError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match Url::parse(s) {
      // 单字母方案视为 Windows 盘符
      Ok(url) if url.scheme().len() > 1 => DetectorSpec::from_url(&url),
      _ => DetectorSpec::from_weights_path(s),
    }
  }
}

impl DetectorSpec {
  /// 根据权重文件扩展名推断后端
  pub fn from_weights_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
    let path = path.as_ref();
    let ext = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_lowercase());
    match ext.as_deref() {
      Some("onnx") => Ok(DetectorSpec {
        backend: Backend::Onnx,
        weights: path.to_path_buf(),
        device: None,
        class_names: None,
      }),
      _ => Err(ModelError::UnsupportedWeights(path.display().to_string())),
    }
  }

  /// 最终使用的设备：规格中显式指定的优先，否则使用服务默认设备
  pub fn resolved_device(&self, default: Device) -> Device {
    self.device.unwrap_or(default)
  }

  pub fn load(&self, default_device: Device) -> Result<DetectorProvider, ModelError> {
    let device = self.resolved_device(default_device);
    info!(
      "加载检测模型: {} (设备: {})",
      self.weights.display(),
      device
    );
    match self.backend {
      #[cfg(feature = "model_onnx")]
      Backend::Onnx => {
        let detector = onnx::OnnxYoloBuilder::new(&self.weights)
          .device(device)
          .class_names(self.class_names.clone())
          .build()?;
        Ok(DetectorProvider::new(self.clone(), Arc::new(detector)))
      }
      #[cfg(not(feature = "model_onnx"))]
      Backend::Onnx => Err(ModelError::BackendDisabled("model_onnx")),
    }
  }
}

/// 检测器提供者：按配置构建一次，之后以引用方式传入流水线。
/// 切换模型时构建新的提供者，而不是修改已有的。
#[derive(Clone)]
pub struct DetectorProvider {
  spec: Option<DetectorSpec>,
  detector: Arc<dyn Detector>,
}

impl DetectorProvider {
  pub fn new(spec: DetectorSpec, detector: Arc<dyn Detector>) -> Self {
    Self {
      spec: Some(spec),
      detector,
    }
  }

  /// 直接包装一个检测器实现
  pub fn from_detector(detector: Arc<dyn Detector>) -> Self {
    Self {
      spec: None,
      detector,
    }
  }

  pub fn detector(&self) -> &dyn Detector {
    self.detector.as_ref()
  }
}

impl fmt::Debug for DetectorProvider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DetectorProvider")
      .field("spec", &self.spec)
      .field("detector", &self.detector.name())
      .finish()
  }
}
