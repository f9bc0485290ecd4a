// 该文件是 WarTrace 项目的一部分。
// src/model.rs - 模型后端能力定义
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

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{BackendConfig, BackendKind};

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型加载失败: {0}")]
  Load(String),
  #[error("推理运行时错误: {0}")]
  Runtime(String),
  #[error("模型输出不符合预期: {0}")]
  UnexpectedOutput(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // 归一化坐标 [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 像素坐标下的轴对齐边界框，保证 x_min <= x_max, y_min <= y_max
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BoundingBox {
  /// 由任意两角构造，坐标会被排序
  pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
    Self {
      x_min: x0.min(x1),
      y_min: y0.min(y1),
      x_max: x0.max(x1),
      y_max: y0.max(y1),
    }
  }

  /// 把归一化坐标换算到 `width x height` 的图像上，并裁剪到图像范围内
  pub fn from_normalized(bbox: &[f32; 4], width: u32, height: u32) -> Self {
    let (w, h) = (width as f32, height as f32);
    let x = |v: f32| (v * w).clamp(0.0, w);
    let y = |v: f32| (v * h).clamp(0.0, h);
    Self::from_corners(x(bbox[0]), y(bbox[1]), x(bbox[2]), y(bbox[3]))
  }

  pub fn width(&self) -> f32 {
    self.x_max - self.x_min
  }

  pub fn height(&self) -> f32 {
    self.y_max - self.y_min
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn center(&self) -> (f32, f32) {
    (
      (self.x_min + self.x_max) / 2.0,
      (self.y_min + self.y_max) / 2.0,
    )
  }
}

/// 经过阈值过滤、标签解析后的检测目标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedObject {
  pub label: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 分类模型的输入张量：batch 为 1，NHWC 排列，取值归一化到 [0, 1]
#[derive(Debug, Clone)]
pub struct RgbNhwcTensor {
  width: u32,
  height: u32,
  data: Box<[f32]>,
}

impl RgbNhwcTensor {
  pub fn from_rgb_image(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let data = image
      .pixels()
      .flat_map(|p| p.0)
      .map(|v| v as f32 / 255.0)
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Self {
      width,
      height,
      data,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[f32] {
    &self.data
  }

  /// 转为 NCHW 排列，供通道优先的模型使用
  pub fn to_nchw(&self) -> Vec<f32> {
    let plane = (self.width * self.height) as usize;
    let mut out = vec![0.0f32; plane * RGB_CHANNELS];
    for (idx, pixel) in self.data.chunks_exact(RGB_CHANNELS).enumerate() {
      for (c, value) in pixel.iter().enumerate() {
        out[c * plane + idx] = *value;
      }
    }
    out
  }
}

/// 边界框检测能力
pub trait DetectModel: Send + Sync {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, BackendError>;

  /// 后端自带的类别名（例如模型元数据），没有时返回 None
  fn class_name(&self, _class_id: u32) -> Option<String> {
    None
  }
}

/// 单标签/多标签分类能力，返回每个类别的分数；单个标量表示二分类
pub trait ClassifyModel: Send + Sync {
  fn infer(&self, input: &RgbNhwcTensor) -> Result<Box<[f32]>, BackendError>;
}

/// 已加载的模型实例，按能力区分
pub enum ModelHandle {
  Detect(Box<dyn DetectModel>),
  Classify(Box<dyn ClassifyModel>),
}

impl ModelHandle {
  pub fn kind(&self) -> BackendKind {
    match self {
      ModelHandle::Detect(_) => BackendKind::Bbox,
      ModelHandle::Classify(_) => BackendKind::Classify,
    }
  }
}

impl std::fmt::Debug for ModelHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ModelHandle({})", self.kind())
  }
}

/// 从模型文件构建 [`ModelHandle`] 的加载器，每种后端能力注册一个
pub trait BackendLoader: Send + Sync {
  fn kind(&self) -> BackendKind;
  fn load(&self, config: &BackendConfig) -> Result<ModelHandle, BackendError>;
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxClassifierLoader, OnnxDetectorLoader};
