// 该文件是 WarTrace 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::info;

use crate::model::DetectedObject;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: Option<FontVec>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font: None,
    }
  }
}

impl Draw {
  /// 加载字体文件后才会绘制标签文字，否则只绘制边框
  pub fn with_font_file(mut self, path: &Path) -> std::io::Result<Self> {
    info!("加载标注字体: {}", path.display());
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data).map_err(|e| {
      std::io::Error::new(std::io::ErrorKind::InvalidData, format!("无效的字体文件: {e}"))
    })?;
    self.font = Some(font);
    Ok(self)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在图像副本上绘制全部检测框
  pub fn draw_detections(&self, image: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
    let mut canvas = image.clone();
    for object in objects {
      self.draw_bbox_with_label(&mut canvas, object, label_color(&object.label));
    }
    canvas
  }

  // bbox 为像素坐标
  fn draw_bbox_with_label(&self, image: &mut RgbImage, object: &DetectedObject, color: Rgb<u8>) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }
    let (w, h) = (image.width() as i32, image.height() as i32);

    let x_min = (object.bbox.x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (object.bbox.y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (object.bbox.x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (object.bbox.y_max.ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（加粗）
    for thickness in 0..BOX_THICKNESS {
      let x0 = (x_min + thickness).min(x_max);
      let y0 = (y_min + thickness).min(y_max);
      let x1 = (x_max - thickness).max(x0);
      let y1 = (y_max - thickness).max(y0);

      for x in x0..=x1 {
        image.put_pixel(x as u32, y0 as u32, color);
        image.put_pixel(x as u32, y1 as u32, color);
      }
      for y in y0..=y1 {
        image.put_pixel(x0 as u32, y as u32, color);
        image.put_pixel(x1 as u32, y as u32, color);
      }
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", object.label, object.confidence);
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;
    let label_height = self.label_text_height as u32;

    // 仅在标签有空间时绘制
    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, label_height);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        &label,
      );
    }
  }
}

/// 同一标签始终使用同一颜色
pub fn label_color(label: &str) -> Rgb<u8> {
  let hash = label
    .bytes()
    .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
  let hue = (hash % 360) as f32;
  hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  #[test]
  fn draws_box_outline_without_font() {
    let image = RgbImage::new(20, 20);
    let object = DetectedObject {
      label: "tank".to_string(),
      confidence: 0.9,
      bbox: BoundingBox::from_corners(2.0, 2.0, 10.0, 10.0),
    };

    let drawn = Draw::default().draw_detections(&image, &[object]);
    let color = label_color("tank");
    assert_eq!(*drawn.get_pixel(2, 2), color);
    assert_eq!(*drawn.get_pixel(10, 5), color);
    assert_eq!(*drawn.get_pixel(6, 6), Rgb([0, 0, 0]));
    // 原图不被修改
    assert_eq!(*image.get_pixel(2, 2), Rgb([0, 0, 0]));
  }

  #[test]
  fn degenerate_boxes_are_ignored() {
    let image = RgbImage::new(10, 10);
    let object = DetectedObject {
      label: "car".to_string(),
      confidence: 0.5,
      bbox: BoundingBox::from_corners(4.0, 4.0, 4.0, 4.0),
    };
    let drawn = Draw::default().draw_detections(&image, &[object]);
    assert!(drawn.pixels().all(|p| *p == Rgb([0, 0, 0])));
  }

  #[test]
  fn label_colors_are_stable() {
    assert_eq!(label_color("person"), label_color("person"));
  }
}
