// 该文件是 Pingpu （平铺检测） 项目的一部分。
// src/merge.rs - 按类别的非极大值抑制
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

use tracing::debug;

use crate::model::Detection;

/// 按类别分组的 NMS。
///
/// 输入必须已是整图坐标。不同类别互不抑制；同类别内按置信度降序
/// （相同置信度保持输入顺序）依次保留，并丢弃与已保留框 IoU >= `iou_threshold`
/// 的其余框。输出按类别首次出现的顺序排列，类内按置信度降序。
pub fn nms_classwise(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  let total = detections.len();

  let keep = {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, d) in detections.iter().enumerate() {
      groups
        .entry(d.class_name.as_str())
        .or_insert_with(|| {
          order.push(d.class_name.as_str());
          Vec::new()
        })
        .push(i);
    }

    let mut keep = Vec::with_capacity(total);
    for class_name in order {
      let Some(mut remaining) = groups.remove(class_name) else {
        continue;
      };
      // 稳定排序，相同置信度保持发现顺序
      remaining.sort_by(|&a, &b| {
        detections[b]
          .confidence
          .total_cmp(&detections[a].confidence)
      });

      while let Some((&best, rest)) = remaining.split_first() {
        keep.push(best);
        let best_box = &detections[best].bbox;
        remaining = rest
          .iter()
          .copied()
          .filter(|&j| best_box.iou(&detections[j].bbox) < iou_threshold)
          .collect();
      }
    }
    keep
  };

  debug!("NMS: {} -> {} 个检测结果", total, keep.len());

  let mut slots: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
  keep
    .into_iter()
    .filter_map(|i| slots[i].take())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::BBox;

  fn det(class_name: &str, confidence: f32, bbox: [f32; 4]) -> Detection {
    Detection::new(class_name, confidence, BBox::from(bbox))
  }

  // IoU = 0.6
  fn overlapping_pair() -> Vec<Detection> {
    vec![
      det("0", 0.8, [0.0, 0.0, 100.0, 60.0]),
      det("0", 0.9, [0.0, 0.0, 100.0, 100.0]),
    ]
  }

  #[test]
  fn suppresses_lower_confidence_above_threshold() {
    let out = nms_classwise(overlapping_pair(), 0.5);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].confidence, 0.9);
  }

  #[test]
  fn keeps_both_below_threshold() {
    let out = nms_classwise(overlapping_pair(), 0.7);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].confidence, 0.9);
    assert_eq!(out[1].confidence, 0.8);
  }

  #[test]
  fn different_classes_never_suppress_each_other() {
    let input = vec![
      det("0", 0.9, [0.0, 0.0, 10.0, 10.0]),
      det("1", 0.8, [0.0, 0.0, 10.0, 10.0]),
    ];
    let out = nms_classwise(input.clone(), 0.0);
    assert_eq!(out, input);
  }

  #[test]
  fn zero_threshold_keeps_one_detection_per_class() {
    let input = vec![
      det("0", 0.7, [10.0, 0.0, 20.0, 5.0]),
      det("0", 0.9, [0.0, 0.0, 10.0, 10.0]),
      det("0", 0.8, [100.0, 100.0, 120.0, 120.0]),
      det("1", 0.3, [0.0, 0.0, 10.0, 10.0]),
    ];
    let out = nms_classwise(input, 0.0);
    let confs: Vec<f32> = out.iter().map(|d| d.confidence).collect();
    // IoU >= 0 恒成立，同类只剩置信度最高的一个
    assert_eq!(confs, vec![0.9, 0.3]);
  }

  #[test]
  fn threshold_of_one_only_removes_identical_boxes() {
    let input = vec![
      det("0", 0.9, [0.0, 0.0, 10.0, 10.0]),
      det("0", 0.8, [0.0, 0.0, 10.0, 10.0]),
      det("0", 0.7, [0.0, 0.0, 10.0, 9.0]),
    ];
    assert_eq!(nms_classwise(input.clone(), 1.0).len(), 2);
    assert_eq!(nms_classwise(input, 1.5).len(), 3);
  }

  #[test]
  fn ties_keep_discovery_order() {
    let input = vec![
      det("0", 0.5, [0.0, 0.0, 10.0, 10.0]),
      det("0", 0.5, [1.0, 0.0, 11.0, 10.0]),
    ];
    let out = nms_classwise(input.clone(), 0.5);
    assert_eq!(out, vec![input[0].clone()]);
  }

  #[test]
  fn output_is_a_consistent_subset() {
    let mut input = Vec::new();
    for i in 0..40 {
      let x = (i * 7 % 50) as f32;
      let y = (i * 13 % 40) as f32;
      let class_name = if i % 3 == 0 { "a" } else { "b" };
      let conf = ((i * 37) % 100) as f32 / 100.0;
      input.push(det(class_name, conf, [x, y, x + 20.0, y + 15.0]));
    }
    let threshold = 0.3;
    let out = nms_classwise(input.clone(), threshold);

    for d in &out {
      assert!(input.contains(d));
    }
    for (i, a) in out.iter().enumerate() {
      for b in out.iter().skip(i + 1) {
        if a.class_name == b.class_name {
          assert!(a.bbox.iou(&b.bbox) < threshold);
        }
      }
    }
    // 每个被抑制的框都能找到一个同类、IoU 超阈值且置信度不低于它的保留框
    for d in input.iter().filter(|d| !out.contains(d)) {
      assert!(out.iter().any(|k| k.class_name == d.class_name
        && k.bbox.iou(&d.bbox) >= threshold
        && k.confidence >= d.confidence));
    }
  }

  #[test]
  fn empty_input() {
    assert!(nms_classwise(Vec::new(), 0.5).is_empty());
  }
}
