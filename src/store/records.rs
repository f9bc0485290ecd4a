// 该文件是 WarTrace 项目的一部分。
// src/store/records.rs - 持久化记录类型
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

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::LabelScore;
use crate::model::{BoundingBox, DetectedObject};
use crate::registry::{DAMAGE_ASSESSMENT, EMERGENCY_RECOGNITION, MILITARY_DETECTION, OBJECT_DETECTION};

/// 内容条目上的四个检测开关
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorFlags {
  pub object_detection: bool,
  pub military_detection: bool,
  pub damage_assessment: bool,
  pub emergency_recognition: bool,
}

impl DetectorFlags {
  pub fn all() -> Self {
    Self {
      object_detection: true,
      military_detection: true,
      damage_assessment: true,
      emergency_recognition: true,
    }
  }

  /// 按固定顺序返回已开启的检测器类型
  pub fn enabled_types(&self) -> Vec<&'static str> {
    [
      (self.object_detection, OBJECT_DETECTION),
      (self.military_detection, MILITARY_DETECTION),
      (self.damage_assessment, DAMAGE_ASSESSMENT),
      (self.emergency_recognition, EMERGENCY_RECOGNITION),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect()
  }

  /// 未知的类型名被忽略
  pub fn from_types<S: AsRef<str>>(types: &[S]) -> Self {
    let mut flags = Self::default();
    for t in types {
      match t.as_ref() {
        OBJECT_DETECTION => flags.object_detection = true,
        MILITARY_DETECTION => flags.military_detection = true,
        DAMAGE_ASSESSMENT => flags.damage_assessment = true,
        EMERGENCY_RECOGNITION => flags.emergency_recognition = true,
        _ => {}
      }
    }
    flags
  }

  pub fn is_empty(&self) -> bool {
    self.enabled_types().is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentItem {
  pub id: i64,
  pub title: String,
  pub flags: DetectorFlags,
  pub created_at: DateTime<Utc>,
}

impl ContentItem {
  pub fn enabled_detector_types(&self) -> Vec<&'static str> {
    self.flags.enabled_types()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaFile {
  pub id: i64,
  pub item_id: i64,
  pub path: PathBuf,
  pub uploaded_at: DateTime<Utc>,
}

/// 每个 (媒体文件, 检测器类型) 至多一条
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub id: i64,
  pub media_file_id: i64,
  pub detector_type: String,
  pub model_name: String,
  pub summary: String,
  /// 标注图像的对外路径，仅边界框检测有
  pub result_path: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectDetectionRow {
  pub id: i64,
  pub detection_id: i64,
  pub label: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
  pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRow {
  pub id: i64,
  pub detection_id: i64,
  pub label: String,
  pub confidence: f32,
  pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationMaskRow {
  pub id: i64,
  pub detection_id: i64,
  pub label: String,
  pub mask_path: String,
  pub confidence: f32,
  pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSegmentationMask {
  pub label: String,
  pub mask_path: String,
  pub confidence: f32,
  pub metadata: Option<serde_json::Value>,
}

/// 待写入的一条检测结果及其全部子记录，在同一事务中写入
#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
  pub media_file_id: i64,
  pub detector_type: String,
  pub model_name: String,
  pub summary: String,
  pub result_path: Option<String>,
  pub objects: Vec<DetectedObject>,
  /// 第一项为最高分类别
  pub classifications: Vec<LabelScore>,
  pub masks: Vec<NewSegmentationMask>,
}

impl NewDetection {
  pub fn new(media_file_id: i64, detector_type: &str, model_name: &str, summary: &str) -> Self {
    Self {
      media_file_id,
      detector_type: detector_type.to_string(),
      model_name: model_name.to_string(),
      summary: summary.to_string(),
      result_path: None,
      objects: Vec::new(),
      classifications: Vec::new(),
      masks: Vec::new(),
    }
  }
}

/// 一条检测结果连同子记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionDetails {
  #[serde(flatten)]
  pub detection: Detection,
  pub objects: Vec<ObjectDetectionRow>,
  pub classifications: Vec<ClassificationRow>,
  pub segmentation_masks: Vec<SegmentationMaskRow>,
}
