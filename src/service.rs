// 该文件是 WarTrace 项目的一部分。
// src/service.rs - 检测服务入口
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

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::batch::{BatchCoordinator, BatchSummary};
use crate::orchestrator::{DetectionOrchestrator, FileOutcome, PipelineError};
use crate::output::OutputError;
use crate::registry::{DetectorSummary, ModelRegistry, RegistryError};
use crate::store::{DetectionDetails, DetectionStore, MediaFile, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("模型目录错误: {0}")]
  Registry(#[from] RegistryError),
  #[error("存储错误: {0}")]
  Store(#[from] StoreError),
  #[error("结果输出错误: {0}")]
  Output(#[from] OutputError),
  #[error(transparent)]
  Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
  #[serde(flatten)]
  pub details: DetectionDetails,
  pub model_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
  pub media_file: MediaFile,
  pub detections: Vec<DetectionReport>,
}

/// 对外的检测入口，组合模型目录、存储与编排器
pub struct DetectionService {
  registry: Arc<ModelRegistry>,
  store: Arc<DetectionStore>,
  orchestrator: Arc<DetectionOrchestrator>,
  batch: BatchCoordinator,
}

impl DetectionService {
  pub fn new(orchestrator: DetectionOrchestrator) -> Self {
    let orchestrator = Arc::new(orchestrator);
    Self {
      registry: orchestrator.cache().registry().clone(),
      store: orchestrator.store().clone(),
      batch: BatchCoordinator::new(orchestrator.clone()),
      orchestrator,
    }
  }

  pub fn store(&self) -> &Arc<DetectionStore> {
    &self.store
  }

  pub fn registry(&self) -> &Arc<ModelRegistry> {
    &self.registry
  }

  /// 按条目上的开关处理其全部文件
  pub fn process_item(&self, item_id: i64) -> Result<BatchSummary, ServiceError> {
    let item = self
      .store
      .content_item(item_id)?
      .ok_or(PipelineError::ContentItemNotFound(item_id))?;
    Ok(self.batch.process(&item)?)
  }

  /// 处理单个文件；`detector_types` 为空时使用所属条目的开关
  pub fn process_file<S: AsRef<str>>(
    &self,
    file_id: i64,
    detector_types: &[S],
  ) -> Result<FileOutcome, ServiceError> {
    let file = self
      .store
      .media_file(file_id)?
      .ok_or(PipelineError::MediaFileNotFound(file_id))?;

    if !detector_types.is_empty() {
      return Ok(self.orchestrator.process_file(&file, detector_types)?);
    }

    let item = self
      .store
      .content_item(file.item_id)?
      .ok_or(PipelineError::ContentItemNotFound(file.item_id))?;
    let types = item.enabled_detector_types();
    info!("文件 #{} 未指定检测器，使用条目设置: {:?}", file_id, types);
    Ok(self.orchestrator.process_file(&file, &types)?)
  }

  pub fn file_report(&self, file_id: i64) -> Result<FileReport, ServiceError> {
    let media_file = self
      .store
      .media_file(file_id)?
      .ok_or(PipelineError::MediaFileNotFound(file_id))?;
    let detections = self
      .store
      .file_details(file_id)?
      .into_iter()
      .map(|details| DetectionReport {
        model_description: self
          .registry
          .model_description(&details.detection.detector_type, &details.detection.model_name)
          .map(str::to_string),
        details,
      })
      .collect();

    Ok(FileReport {
      media_file,
      detections,
    })
  }

  /// 条目下每个文件的报告，按文件 id 升序
  pub fn item_report(&self, item_id: i64) -> Result<Vec<FileReport>, ServiceError> {
    if self.store.content_item(item_id)?.is_none() {
      return Err(PipelineError::ContentItemNotFound(item_id).into());
    }
    self
      .store
      .media_files_for_item(item_id)?
      .iter()
      .map(|file| self.file_report(file.id))
      .collect()
  }

  pub fn detector_catalog(&self) -> Vec<DetectorSummary> {
    self.registry.catalog()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{DAMAGE_ASSESSMENT, OBJECT_DETECTION};
  use crate::store::DetectorFlags;
  use crate::testing::Fixture;

  #[test]
  fn process_item_requires_existing_item() {
    let fixture = Fixture::new();
    let service = DetectionService::new(fixture.orchestrator());
    assert!(matches!(
      service.process_item(404),
      Err(ServiceError::Pipeline(PipelineError::ContentItemNotFound(404)))
    ));
  }

  #[test]
  fn process_file_falls_back_to_item_flags() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags {
      damage_assessment: true,
      ..Default::default()
    });
    let file = fixture.image_file(item.id, "roof.jpg");
    let service = DetectionService::new(fixture.orchestrator());

    let outcome = service.process_file::<&str>(file.id, &[]).unwrap();
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(outcome.created[0].detector_type, DAMAGE_ASSESSMENT);

    let explicit = service.process_file(file.id, &[OBJECT_DETECTION]).unwrap();
    assert_eq!(explicit.created[0].detector_type, OBJECT_DETECTION);

    assert!(matches!(
      service.process_file(file.id + 50, &[OBJECT_DETECTION]),
      Err(ServiceError::Pipeline(PipelineError::MediaFileNotFound(_)))
    ));
  }

  #[test]
  fn reports_carry_children_and_descriptions() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags {
      object_detection: true,
      damage_assessment: true,
      ..Default::default()
    });
    let file = fixture.image_file(item.id, "scene.jpg");
    fixture.raw_file(item.id, "notes.pdf", b"%PDF");
    let service = DetectionService::new(fixture.orchestrator());

    let summary = service.process_item(item.id).unwrap();
    assert_eq!(summary.processed_file_count, 1);

    let report = service.file_report(file.id).unwrap();
    assert_eq!(report.detections.len(), 2);
    let objects = &report.detections[0];
    assert_eq!(objects.details.objects.len(), 1);
    assert_eq!(
      objects.model_description.as_deref(),
      Some("General object recognition (people, vehicles, etc.)")
    );
    assert_eq!(report.detections[1].details.classifications.len(), 4);

    let reports = service.item_report(item.id).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports[1].detections.is_empty());

    let json = serde_json::to_value(&reports[0]).unwrap();
    assert_eq!(json["detections"][0]["detector_type"], OBJECT_DETECTION);
    let x_min = json["detections"][0]["objects"][0]["bbox"]["x_min"]
      .as_f64()
      .unwrap();
    assert!((x_min - 6.4).abs() < 1e-3);
  }

  #[test]
  fn catalog_lists_builtin_detectors_in_order() {
    let fixture = Fixture::new();
    let service = DetectionService::new(fixture.orchestrator());
    let catalog = service.detector_catalog();
    let types: Vec<_> = catalog.iter().map(|d| d.detector_type.as_str()).collect();
    assert_eq!(
      types,
      vec![
        "object_detection",
        "military_detection",
        "damage_assessment",
        "emergency_recognition"
      ]
    );
  }
}
