// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/tile.rs - 切片调度
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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{geometry::BBox, model::Detection};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
  #[error("切片尺寸必须大于 0")]
  InvalidTileSize,
  #[error("重叠比例必须位于 [0, 1) 区间内, 实际为 {0}")]
  InvalidOverlap(f32),
  #[error("图像尺寸为空: {0}x{1}")]
  EmptyImage(u32, u32),
  #[error("无法识别的切片模式 '{0}'，可选值: auto, on, off")]
  InvalidMode(String),
}

/// 切片模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TileMode {
  /// 图像长边超过切片尺寸时启用
  #[default]
  Auto,
  On,
  Off,
}

impl FromStr for TileMode {
  type Err = TileError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "auto" => Ok(TileMode::Auto),
      "1" | "true" | "yes" | "on" => Ok(TileMode::On),
      "0" | "false" | "no" | "off" => Ok(TileMode::Off),
      _ => Err(TileError::InvalidMode(s.to_string())),
    }
  }
}

impl TryFrom<String> for TileMode {
  type Error = TileError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<TileMode> for String {
  fn from(mode: TileMode) -> Self {
    mode.to_string()
  }
}

impl fmt::Display for TileMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TileMode::Auto => write!(f, "auto"),
      TileMode::On => write!(f, "on"),
      TileMode::Off => write!(f, "off"),
    }
  }
}

/// 切片区域，整数像素边界 [left, right) x [top, bottom)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
  pub left: u32,
  pub top: u32,
  pub right: u32,
  pub bottom: u32,
}

impl Tile {
  pub fn width(&self) -> u32 {
    self.right - self.left
  }

  pub fn height(&self) -> u32 {
    self.bottom - self.top
  }

  pub fn is_full_image(&self, width: u32, height: u32) -> bool {
    self.left == 0 && self.top == 0 && self.right == width && self.bottom == height
  }

  /// 把切片局部坐标下的检测结果平移到整图坐标
  pub fn to_global(&self, detection: Detection) -> Detection {
    Detection {
      bbox: self.offset(&detection.bbox),
      ..detection
    }
  }

  fn offset(&self, bbox: &BBox) -> BBox {
    bbox.translate(self.left as f32, self.top as f32)
  }
}

/// 切片参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileConfig {
  pub mode: TileMode,
  pub tile_size: u32,
  pub overlap: f32,
}

impl Default for TileConfig {
  fn default() -> Self {
    Self {
      mode: TileMode::Auto,
      tile_size: 640,
      overlap: 0.2,
    }
  }
}

impl TileConfig {
  pub fn validate(&self) -> Result<(), TileError> {
    if self.tile_size == 0 {
      return Err(TileError::InvalidTileSize);
    }
    if !self.overlap.is_finite() || !(0.0..1.0).contains(&self.overlap) {
      return Err(TileError::InvalidOverlap(self.overlap));
    }
    Ok(())
  }

  /// 相邻切片起点之间的步长，至少为 1
  pub fn step(&self) -> u32 {
    ((self.tile_size as f32 * (1.0 - self.overlap)).round() as u32).max(1)
  }

  pub fn wants_tiling(&self, width: u32, height: u32) -> bool {
    match self.mode {
      TileMode::On => true,
      TileMode::Off => false,
      TileMode::Auto => width.max(height) > self.tile_size,
    }
  }
}

/// 调度结果：是否切片以及按行优先排列的切片序列。
/// 不切片时序列中只有一个与整图相同的区域。
#[derive(Debug, Clone, PartialEq)]
pub struct TilePlan {
  pub tiled: bool,
  pub tiles: Vec<Tile>,
}

impl TilePlan {
  pub fn schedule(width: u32, height: u32, config: &TileConfig) -> Result<Self, TileError> {
    config.validate()?;
    if width == 0 || height == 0 {
      return Err(TileError::EmptyImage(width, height));
    }

    if !config.wants_tiling(width, height) {
      return Ok(TilePlan {
        tiled: false,
        tiles: vec![Tile {
          left: 0,
          top: 0,
          right: width,
          bottom: height,
        }],
      });
    }

    let step = config.step() as usize;
    let size = config.tile_size;
    let mut tiles = Vec::new();
    for top in (0..height).step_by(step) {
      for left in (0..width).step_by(step) {
        let right = left.saturating_add(size).min(width);
        let bottom = top.saturating_add(size).min(height);
        if right <= left || bottom <= top {
          continue;
        }
        tiles.push(Tile {
          left,
          top,
          right,
          bottom,
        });
      }
    }

    Ok(TilePlan { tiled: true, tiles })
  }
}
