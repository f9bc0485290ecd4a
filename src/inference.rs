// 该文件是 WarTrace 项目的一部分。
// src/inference.rs - 推理适配：把不同后端的输出整理成统一结果
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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use image::{ImageReader, RgbImage, imageops::FilterType};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::LoadedModel;
use crate::model::{
  BackendError, BoundingBox, ClassifyModel, DetectModel, DetectedObject, ModelHandle,
  RgbNhwcTensor,
};
use crate::output::{OutputError, ResultStore, StoredImage, draw::Draw};
use crate::registry::BackendConfig;

const POSITIVE_LABEL: &str = "positive";
const NEGATIVE_LABEL: &str = "negative";

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像读取错误: {0}")]
  ImageLoad(#[from] image::ImageError),
  #[error("推理后端错误: {0}")]
  Backend(#[from] BackendError),
  #[error("模型输出不符合预期: {0}")]
  UnexpectedOutput(String),
  #[error("标注图像输出错误: {0}")]
  Output(#[from] OutputError),
}

/// 已解码的待检测图像
#[derive(Debug, Clone)]
pub struct SourceImage {
  pub path: PathBuf,
  pub image: RgbImage,
  /// 文件修改时间（Unix 秒），用于区分同名文件的不同版本
  pub fingerprint: u64,
}

impl SourceImage {
  pub fn open(path: &Path) -> Result<Self, InferenceError> {
    let fingerprint = std::fs::metadata(path)?
      .modified()
      .ok()
      .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
      .map(|d| d.as_secs())
      .unwrap_or_default();
    let image = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()?
      .to_rgb8();

    Ok(Self {
      path: path.to_path_buf(),
      image,
      fingerprint,
    })
  }

  pub fn stem(&self) -> String {
    self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "image".to_string())
  }

  /// 标注图像文件名：`det_{文件名}_{修改时间}_{检测器类型}.jpg`
  pub fn annotated_file_name(&self, detector_type: &str) -> String {
    format!(
      "det_{}_{}_{}.jpg",
      self.stem(),
      self.fingerprint,
      detector_type
    )
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct BboxOutcome {
  pub objects: Vec<DetectedObject>,
  pub rendered: StoredImage,
  pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
  pub label: String,
  pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifyOutcome {
  pub top_label: String,
  pub top_confidence: f32,
  /// 全部类别分数，顺序与模型输出一致
  pub all_scores: Vec<LabelScore>,
  pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InferenceOutcome {
  Objects(BboxOutcome),
  Classes(ClassifyOutcome),
}

impl InferenceOutcome {
  pub fn summary(&self) -> &str {
    match self {
      InferenceOutcome::Objects(o) => &o.summary,
      InferenceOutcome::Classes(c) => &c.summary,
    }
  }
}

/// 按模型能力分派推理，并把结果整理成统一形状
pub struct InferenceAdapter {
  draw: Draw,
  results: Arc<dyn ResultStore>,
}

impl InferenceAdapter {
  pub fn new(results: Arc<dyn ResultStore>) -> Self {
    Self {
      draw: Draw::default(),
      results,
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn run(
    &self,
    model: &LoadedModel,
    source: &SourceImage,
  ) -> Result<InferenceOutcome, InferenceError> {
    match &model.handle {
      ModelHandle::Detect(detector) => self
        .detect(
          detector.as_ref(),
          &model.config,
          source,
          &model.detector_type,
        )
        .map(InferenceOutcome::Objects),
      ModelHandle::Classify(classifier) => {
        classify(classifier.as_ref(), &model.config, source).map(InferenceOutcome::Classes)
      }
    }
  }

  /// 边界框检测：过滤阈值、换算像素坐标、写出标注图像。
  /// 写标注图像是该操作声明的副作用，写入位置在返回值中。
  pub fn detect(
    &self,
    model: &dyn DetectModel,
    config: &BackendConfig,
    source: &SourceImage,
    detector_type: &str,
  ) -> Result<BboxOutcome, InferenceError> {
    let now = std::time::Instant::now();
    let raw = model.infer(&source.image)?;
    debug!(
      "{} 推理完成，耗时: {:.2?}, 原始目标 {} 个",
      config.model_name,
      now.elapsed(),
      raw.len()
    );

    let (width, height) = source.image.dimensions();
    let objects: Vec<DetectedObject> = raw
      .items
      .iter()
      .filter(|item| {
        item.score.is_finite()
          && item.score >= config.confidence_threshold
          && item.bbox.iter().all(|v| v.is_finite())
      })
      .map(|item| DetectedObject {
        label: config
          .label(item.class_id as usize)
          .map(str::to_string)
          .or_else(|| model.class_name(item.class_id))
          .unwrap_or_else(|| format!("class_{}", item.class_id)),
        confidence: item.score.clamp(0.0, 1.0),
        bbox: BoundingBox::from_normalized(&item.bbox, width, height),
      })
      .collect();

    let annotated = self.draw.draw_detections(&source.image, &objects);
    let rendered = self
      .results
      .save_image(&source.annotated_file_name(detector_type), &annotated)?;

    let summary = format!("Found {} objects", objects.len());
    Ok(BboxOutcome {
      objects,
      rendered,
      summary,
    })
  }
}

/// 分类：缩放到模型输入尺寸、归一化后前向推理。
/// 多类别输出取最大值；单个标量按阈值判为 positive/negative。
pub fn classify(
  model: &dyn ClassifyModel,
  config: &BackendConfig,
  source: &SourceImage,
) -> Result<ClassifyOutcome, InferenceError> {
  let size = config.input_size();
  let resized = image::imageops::resize(&source.image, size, size, FilterType::Triangle);
  let input = RgbNhwcTensor::from_rgb_image(&resized);

  let now = std::time::Instant::now();
  let scores = model.infer(&input)?;
  debug!(
    "{} 分类完成，耗时: {:.2?}, 输出 {} 个分数",
    config.model_name,
    now.elapsed(),
    scores.len()
  );

  if scores.iter().any(|s| !s.is_finite()) {
    return Err(InferenceError::UnexpectedOutput(format!(
      "分类输出包含非法数值: {:?}",
      scores
    )));
  }

  let (top_label, top_confidence, all_scores) = match scores.as_ref() {
    [] => {
      return Err(InferenceError::UnexpectedOutput("分类输出为空".to_string()));
    }
    [score] => {
      let p = score.clamp(0.0, 1.0);
      let positive = p > config.confidence_threshold;
      let all = vec![
        LabelScore {
          label: POSITIVE_LABEL.to_string(),
          confidence: p,
        },
        LabelScore {
          label: NEGATIVE_LABEL.to_string(),
          confidence: 1.0 - p,
        },
      ];
      if positive {
        (POSITIVE_LABEL.to_string(), p, all)
      } else {
        (NEGATIVE_LABEL.to_string(), 1.0 - p, all)
      }
    }
    scores => {
      if let Some(labels) = &config.labels
        && labels.len() != scores.len()
      {
        warn!(
          "模型 {} 输出 {} 个类别, 标签集有 {} 个",
          config.model_name,
          scores.len(),
          labels.len()
        );
      }

      let all: Vec<LabelScore> = scores
        .iter()
        .enumerate()
        .map(|(i, s)| LabelScore {
          label: config
            .label(i)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{i}")),
          confidence: s.clamp(0.0, 1.0),
        })
        .collect();
      // 在原始输出上取最大值，并列时取第一个；logits 截断后会全部并列在 1.0
      let top_index = scores
        .iter()
        .enumerate()
        .fold(0, |best, (i, s)| if *s > scores[best] { i } else { best });
      let top = all[top_index].clone();
      (top.label, top.confidence, all)
    }
  };

  let summary = format!(
    "Classified as {} with {:.2} confidence",
    top_label, top_confidence
  );
  Ok(ClassifyOutcome {
    top_label,
    top_confidence,
    all_scores,
    summary,
  })
}
