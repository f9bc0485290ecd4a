// 该文件是 WarTrace 项目的一部分。
// src/orchestrator.rs - 单个媒体文件的检测流程
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

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{ModelCache, ModelError};
use crate::inference::{InferenceAdapter, InferenceError, InferenceOutcome, LabelScore, SourceImage};
use crate::store::{Detection, DetectionStore, MediaFile, NewDetection, StoreError};

/// 可以送入检测的图像扩展名（小写）
pub const PROCESSABLE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("存储错误: {0}")]
  Storage(#[from] StoreError),
  #[error("媒体文件不存在: {0}")]
  MediaFileNotFound(i64),
  #[error("内容条目不存在: {0}")]
  ContentItemNotFound(i64),
}

/// 单个检测器失败的原因，只影响该检测器
#[derive(Error, Debug)]
pub enum DetectorError {
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
  UnsupportedFileFormat { extension: String },
  SourceMissing,
  UnreadableImage { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorFailure {
  pub detector_type: String,
  pub message: String,
}

/// 单个文件的处理结果。`created` 只含本次新写入的记录，`existing` 为已有记录。
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileOutcome {
  pub media_file_id: i64,
  pub requested: Vec<String>,
  pub created: Vec<Detection>,
  pub existing: Vec<Detection>,
  pub skipped: Option<SkipReason>,
  pub failures: Vec<DetectorFailure>,
}

impl FileOutcome {
  fn new(media_file_id: i64, requested: Vec<String>, existing: Vec<Detection>) -> Self {
    Self {
      media_file_id,
      requested,
      existing,
      ..Default::default()
    }
  }

  /// 本文件上请求类型的全部检测记录
  pub fn all(&self) -> Vec<&Detection> {
    self.existing.iter().chain(self.created.iter()).collect()
  }

  /// 请求的每个类型都已有记录
  pub fn is_complete(&self) -> bool {
    self
      .requested
      .iter()
      .all(|t| self.all().iter().any(|d| &d.detector_type == t))
  }

  /// 本次未写入任何记录，且请求的类型早已全部处理过
  pub fn is_already_processed(&self) -> bool {
    self.created.is_empty() && !self.requested.is_empty() && self.is_complete()
  }
}

/// 扩展名不在白名单内时返回跳过原因
pub fn check_eligibility(path: &Path) -> Option<SkipReason> {
  let extension = path
    .extension()
    .map(|e| e.to_string_lossy().to_lowercase())
    .unwrap_or_default();
  if PROCESSABLE_EXTENSIONS.contains(&extension.as_str()) {
    None
  } else {
    Some(SkipReason::UnsupportedFileFormat { extension })
  }
}

/// 对一个媒体文件执行：过滤已处理类型、检查格式、逐个检测器推理、写入结果
pub struct DetectionOrchestrator {
  cache: Arc<ModelCache>,
  store: Arc<DetectionStore>,
  adapter: InferenceAdapter,
}

impl DetectionOrchestrator {
  pub fn new(cache: Arc<ModelCache>, store: Arc<DetectionStore>, adapter: InferenceAdapter) -> Self {
    Self {
      cache,
      store,
      adapter,
    }
  }

  pub fn cache(&self) -> &Arc<ModelCache> {
    &self.cache
  }

  pub fn store(&self) -> &Arc<DetectionStore> {
    &self.store
  }

  /// 只有致命的存储错误会返回 `Err`，其余失败记录在结果里
  pub fn process_file<S: AsRef<str>>(
    &self,
    file: &MediaFile,
    detector_types: &[S],
  ) -> Result<FileOutcome, PipelineError> {
    let mut requested: Vec<String> = Vec::with_capacity(detector_types.len());
    for t in detector_types {
      if !requested.iter().any(|r| r == t.as_ref()) {
        requested.push(t.as_ref().to_string());
      }
    }

    let existing: Vec<Detection> = self
      .store
      .detections_for_file(file.id)?
      .into_iter()
      .filter(|d| requested.contains(&d.detector_type))
      .collect();
    let remaining: Vec<String> = requested
      .iter()
      .filter(|t| !existing.iter().any(|d| &d.detector_type == *t))
      .cloned()
      .collect();

    let mut outcome = FileOutcome::new(file.id, requested, existing);
    if remaining.is_empty() {
      debug!("文件 #{} 的请求类型均已处理，跳过", file.id);
      return Ok(outcome);
    }

    if let Some(reason) = check_eligibility(&file.path) {
      info!("跳过不支持的文件: {}", file.path.display());
      outcome.skipped = Some(reason);
      return Ok(outcome);
    }

    if !file.path.exists() {
      warn!("媒体文件 #{} 不存在: {}", file.id, file.path.display());
      outcome.skipped = Some(SkipReason::SourceMissing);
      return Ok(outcome);
    }

    let source = match SourceImage::open(&file.path) {
      Ok(source) => source,
      Err(e) => {
        warn!("无法读取图像 {}: {}", file.path.display(), e);
        outcome.skipped = Some(SkipReason::UnreadableImage {
          message: e.to_string(),
        });
        return Ok(outcome);
      }
    };

    for detector_type in &remaining {
      let (new, rendered) = match self.run_detector(file.id, &source, detector_type) {
        Ok(run) => run,
        Err(e) => {
          error!("文件 #{} 执行 {} 失败: {}", file.id, detector_type, e);
          outcome.failures.push(DetectorFailure {
            detector_type: detector_type.clone(),
            message: e.to_string(),
          });
          continue;
        }
      };

      match self.store.record_detection(&new) {
        Ok(detection) => {
          info!(
            "文件 #{} {} 完成: {}",
            file.id, detector_type, detection.summary
          );
          outcome.created.push(detection);
        }
        Err(StoreError::DuplicateDetection { .. }) => {
          // 另一个进程先写入了同一条记录
          info!("文件 #{} 的 {} 已由其他任务写入", file.id, detector_type);
          let winner = self.store.detection(file.id, detector_type)?;
          // 标注图像文件名是确定的，对方可能引用了同一个文件
          if winner.as_ref().map(|d| &d.result_path) != Some(&new.result_path) {
            discard_render(rendered.as_deref());
          }
          if let Some(detection) = winner {
            outcome.existing.push(detection);
          }
        }
        Err(e) if e.is_fatal() => {
          discard_render(rendered.as_deref());
          return Err(e.into());
        }
        Err(e) => {
          discard_render(rendered.as_deref());
          error!("文件 #{} 写入 {} 失败: {}", file.id, detector_type, e);
          outcome.failures.push(DetectorFailure {
            detector_type: detector_type.clone(),
            message: e.to_string(),
          });
        }
      }
    }

    Ok(outcome)
  }

  fn run_detector(
    &self,
    media_file_id: i64,
    source: &SourceImage,
    detector_type: &str,
  ) -> Result<(NewDetection, Option<PathBuf>), DetectorError> {
    let model = self.cache.get(detector_type, None)?;
    let outcome = self.adapter.run(&model, source)?;

    let mut new = NewDetection::new(
      media_file_id,
      detector_type,
      &model.config.model_name,
      outcome.summary(),
    );
    let mut rendered = None;
    match outcome {
      InferenceOutcome::Objects(objects) => {
        new.result_path = Some(objects.rendered.relative_path);
        new.objects = objects.objects;
        rendered = Some(objects.rendered.path);
      }
      InferenceOutcome::Classes(classes) => {
        // 最高分类别在前，其余按模型输出顺序
        let mut ranked = vec![LabelScore {
          label: classes.top_label.clone(),
          confidence: classes.top_confidence,
        }];
        ranked.extend(
          classes
            .all_scores
            .into_iter()
            .filter(|s| s.label != classes.top_label),
        );
        new.classifications = ranked;
      }
    }
    Ok((new, rendered))
  }
}

/// 删除没有写入数据库的标注图像
fn discard_render(path: Option<&Path>) {
  let Some(path) = path else {
    return;
  };
  match std::fs::remove_file(path) {
    Ok(()) => debug!("删除未入库的标注图像: {}", path.display()),
    Err(e) => warn!("删除标注图像 {} 失败: {}", path.display(), e),
  }
}
