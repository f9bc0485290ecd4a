// 该文件是 WarTrace 项目的一部分。
// src/batch.rs - 内容条目的批量检测
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
use tracing::{info, warn};

use crate::orchestrator::{DetectionOrchestrator, PipelineError};
use crate::store::ContentItem;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
  /// 本次至少新写入一条检测记录的文件数
  pub processed_file_count: usize,
  /// 本次新写入的检测记录数
  pub detection_count: usize,
  /// 请求的类型早已全部处理过的文件数
  pub already_processed_count: usize,
}

pub struct BatchCoordinator {
  orchestrator: Arc<DetectionOrchestrator>,
}

impl BatchCoordinator {
  pub fn new(orchestrator: Arc<DetectionOrchestrator>) -> Self {
    Self { orchestrator }
  }

  /// 按条目上开启的检测器处理其全部文件。单个文件的失败只记日志，
  /// 只有致命的存储错误会中止整个批次。
  pub fn process(&self, item: &ContentItem) -> Result<BatchSummary, PipelineError> {
    let detector_types = item.enabled_detector_types();
    let mut summary = BatchSummary::default();
    if detector_types.is_empty() {
      info!("内容条目 #{} 未开启任何检测", item.id);
      return Ok(summary);
    }

    let files = self.orchestrator.store().media_files_for_item(item.id)?;
    info!(
      "开始处理内容条目 #{}: {} 个文件, 检测器 {:?}",
      item.id,
      files.len(),
      detector_types
    );

    let now = std::time::Instant::now();
    for file in &files {
      let outcome = match self.orchestrator.process_file(file, &detector_types) {
        Ok(outcome) => outcome,
        Err(PipelineError::Storage(e)) if !e.is_fatal() => {
          // 留待下次运行补齐
          warn!("文件 #{} 暂时无法处理: {}", file.id, e);
          continue;
        }
        Err(e) => return Err(e),
      };

      if let Some(reason) = &outcome.skipped {
        warn!("文件 #{} 被跳过: {:?}", file.id, reason);
      }
      for failure in &outcome.failures {
        warn!(
          "文件 #{} 的 {} 未完成: {}",
          file.id, failure.detector_type, failure.message
        );
      }

      if !outcome.created.is_empty() {
        summary.processed_file_count += 1;
        summary.detection_count += outcome.created.len();
      } else if outcome.is_already_processed() {
        summary.already_processed_count += 1;
      }
    }

    info!(
      "内容条目 #{} 处理完成，耗时: {:.2?}, 新处理 {} 个文件, 新增 {} 条检测, {} 个文件已处理过",
      item.id,
      now.elapsed(),
      summary.processed_file_count,
      summary.detection_count,
      summary.already_processed_count
    );
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::DetectorFlags;
  use crate::testing::Fixture;

  fn coordinator(fixture: &Fixture) -> BatchCoordinator {
    BatchCoordinator::new(Arc::new(fixture.orchestrator()))
  }

  #[test]
  fn single_jpeg_with_object_detection() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags {
      object_detection: true,
      ..Default::default()
    });
    let file = fixture.image_file(item.id, "a.jpg");

    let summary = coordinator(&fixture).process(&item).unwrap();
    assert_eq!(
      summary,
      BatchSummary {
        processed_file_count: 1,
        detection_count: 1,
        already_processed_count: 0,
      }
    );

    let detections = fixture.store.detections_for_file(file.id).unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].detector_type, "object_detection");
    assert_eq!(detections[0].model_name, "yolo11m");
    let result_path = detections[0].result_path.as_deref().unwrap();
    assert!(result_path.starts_with("/detection_results/det_a_"));
    assert!(
      fixture
        .results_dir()
        .join(result_path.trim_start_matches("/detection_results/"))
        .exists()
    );
  }

  #[test]
  fn rerun_reports_already_processed() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags {
      object_detection: true,
      ..Default::default()
    });
    fixture.image_file(item.id, "a.jpg");
    let coordinator = coordinator(&fixture);

    coordinator.process(&item).unwrap();
    let again = coordinator.process(&item).unwrap();
    assert_eq!(
      again,
      BatchSummary {
        processed_file_count: 0,
        detection_count: 0,
        already_processed_count: 1,
      }
    );
    assert_eq!(fixture.store.detection_count().unwrap(), 1);
  }

  #[test]
  fn failing_file_does_not_stop_the_batch() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags {
      object_detection: true,
      damage_assessment: true,
      ..Default::default()
    });
    fixture.image_file(item.id, "one.jpg");
    fixture.raw_file(item.id, "two.jpg", b"truncated");
    fixture.image_file(item.id, "three.png");

    let summary = coordinator(&fixture).process(&item).unwrap();
    assert_eq!(summary.processed_file_count, 2);
    assert_eq!(summary.detection_count, 4);
    assert_eq!(summary.already_processed_count, 0);
  }

  #[test]
  fn non_image_files_are_not_counted() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags::all());
    fixture.raw_file(item.id, "report.pdf", b"%PDF-1.7");

    let summary = coordinator(&fixture).process(&item).unwrap();
    assert_eq!(summary, BatchSummary::default());
    assert_eq!(fixture.store.detection_count().unwrap(), 0);
  }

  #[test]
  fn item_without_flags_touches_nothing() {
    let fixture = Fixture::new();
    let item = fixture.item(DetectorFlags::default());
    fixture.image_file(item.id, "a.jpg");

    let summary = coordinator(&fixture).process(&item).unwrap();
    assert_eq!(summary, BatchSummary::default());
    assert_eq!(fixture.store.detection_count().unwrap(), 0);
  }

  #[test]
  fn newly_enabled_flag_only_runs_missing_type() {
    let fixture = Fixture::new();
    let mut item = fixture.item(DetectorFlags {
      object_detection: true,
      ..Default::default()
    });
    fixture.image_file(item.id, "a.jpg");
    let coordinator = coordinator(&fixture);
    coordinator.process(&item).unwrap();

    item.flags.emergency_recognition = true;
    let summary = coordinator.process(&item).unwrap();
    assert_eq!(summary.processed_file_count, 1);
    assert_eq!(summary.detection_count, 1);
    assert_eq!(fixture.store.detection_count().unwrap(), 2);
  }
}
