// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use std::collections::HashMap;

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::model::Detection;

const BOX_THICKNESS: u32 = 2;
const FALLBACK_COLOR: [u8; 3] = [94, 197, 34];

/// 类别到边框颜色的映射
#[derive(Debug, Clone)]
pub struct Palette {
  colors: HashMap<String, [u8; 3]>,
  fallback: [u8; 3],
}

impl Default for Palette {
  fn default() -> Self {
    let colors = [
      ("0", [255, 255, 0]),
      ("1", [255, 165, 0]),
      ("2", [0, 0, 0]),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    Self {
      colors,
      fallback: FALLBACK_COLOR,
    }
  }
}

impl Palette {
  pub fn color_of(&self, class_name: &str) -> [u8; 3] {
    self.colors.get(class_name).copied().unwrap_or(self.fallback)
  }
}

#[derive(Debug, Clone)]
pub struct Draw {
  palette: Palette,
  thickness: u32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      palette: Palette::default(),
      thickness: BOX_THICKNESS,
    }
  }
}

impl Draw {
  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for d in detections {
      self.draw_bbox(image, d);
    }
  }

  // 整数化并裁剪到图像范围后逐层向内绘制空心矩形
  fn draw_bbox(&self, image: &mut RgbImage, detection: &Detection) {
    let Some(r) = detection
      .bbox
      .to_pixel_rect(image.width(), image.height())
    else {
      return;
    };
    let color = Rgb(self.palette.color_of(&detection.class_name));

    for t in 0..self.thickness {
      let (x1, y1) = (r.x1 + t, r.y1 + t);
      let (x2, y2) = (r.x2.saturating_sub(t), r.y2.saturating_sub(t));
      if x1 > x2 || y1 > y2 {
        break;
      }
      let rect = Rect::at(x1 as i32, y1 as i32).of_size(x2 - x1 + 1, y2 - y1 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::BBox;

  #[test]
  fn palette_falls_back_for_unknown_classes() {
    let palette = Palette::default();
    assert_eq!(palette.color_of("0"), [255, 255, 0]);
    assert_eq!(palette.color_of("1"), [255, 165, 0]);
    assert_eq!(palette.color_of("2"), [0, 0, 0]);
    assert_eq!(palette.color_of("truck"), FALLBACK_COLOR);
  }

  #[test]
  fn draws_two_pixel_border() {
    let mut image = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
    let det = Detection::new("2", 0.9, BBox::new(5.0, 5.0, 14.0, 14.0));
    Draw::default().draw_detections(&mut image, &[det]);

    let black = Rgb([0, 0, 0]);
    let white = Rgb([255, 255, 255]);
    assert_eq!(*image.get_pixel(5, 5), black);
    assert_eq!(*image.get_pixel(14, 10), black);
    assert_eq!(*image.get_pixel(6, 10), black);
    assert_eq!(*image.get_pixel(13, 6), black);
    assert_eq!(*image.get_pixel(7, 7), white);
    assert_eq!(*image.get_pixel(10, 10), white);
    assert_eq!(*image.get_pixel(4, 4), white);
    assert_eq!(*image.get_pixel(15, 15), white);
  }

  #[test]
  fn clamps_boxes_outside_the_image() {
    let mut image = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
    let det = Detection::new("x", 0.5, BBox::new(-30.0, -30.0, 300.0, 300.0));
    Draw::default().draw_detections(&mut image, &[det]);
    assert_eq!(*image.get_pixel(0, 0), Rgb(FALLBACK_COLOR));
    assert_eq!(*image.get_pixel(9, 9), Rgb(FALLBACK_COLOR));
    assert_eq!(*image.get_pixel(5, 5), Rgb([255, 255, 255]));
  }
}
