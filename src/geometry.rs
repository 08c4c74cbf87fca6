// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/geometry.rs - 边界框几何运算
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

use serde::{Deserialize, Serialize};

/// 轴对齐边界框，像素坐标 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BBox {
  pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  /// 面积，退化框为 0
  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }

  pub fn intersection_area(&self, other: &BBox) -> f32 {
    let iw = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
    let ih = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
    iw * ih
  }

  /// 交并比，并集面积为 0 时返回 0.0
  pub fn iou(&self, other: &BBox) -> f32 {
    let inter = self.intersection_area(other);
    if inter <= 0.0 {
      return 0.0;
    }
    let union = self.area() + other.area() - inter;
    if union > 0.0 {
      (inter / union).clamp(0.0, 1.0)
    } else {
      0.0
    }
  }

  /// 平移 (dx, dy)，用于切片局部坐标与整图坐标之间的换算
  pub fn translate(&self, dx: f32, dy: f32) -> BBox {
    BBox {
      x1: self.x1 + dx,
      y1: self.y1 + dy,
      x2: self.x2 + dx,
      y2: self.y2 + dy,
    }
  }

  /// 四舍五入并限制在 [0, w-1] x [0, h-1] 内的整数像素框，仅用于绘制。
  /// 图像为空时返回 None。
  pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<PixelRect> {
    if width == 0 || height == 0 {
      return None;
    }
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    Some(PixelRect {
      x1: (self.x1.round() as i64).clamp(0, max_x) as u32,
      y1: (self.y1.round() as i64).clamp(0, max_y) as u32,
      x2: (self.x2.round() as i64).clamp(0, max_x) as u32,
      y2: (self.y2.round() as i64).clamp(0, max_y) as u32,
    })
  }
}

impl From<[f32; 4]> for BBox {
  fn from(v: [f32; 4]) -> Self {
    BBox::new(v[0], v[1], v[2], v[3])
  }
}

/// 整数像素框，两端都包含
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub x1: u32,
  pub y1: u32,
  pub x2: u32,
  pub y2: u32,
}
