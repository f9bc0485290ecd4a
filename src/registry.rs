// 该文件是 WarTrace 项目的一部分。
// src/registry.rs - 检测器与模型目录
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

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const OBJECT_DETECTION: &str = "object_detection";
pub const MILITARY_DETECTION: &str = "military_detection";
pub const DAMAGE_ASSESSMENT: &str = "damage_assessment";
pub const EMERGENCY_RECOGNITION: &str = "emergency_recognition";

const DEFAULT_BBOX_INPUT_SIZE: u32 = 640;
const DEFAULT_CLASSIFY_INPUT_SIZE: u32 = 224;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug)]
pub enum RegistryError {
  #[error("未知的检测器类型: {0}")]
  UnknownDetectorType(String),
  #[error("检测器已停用: {0}")]
  DetectorDisabled(String),
  #[error("检测器 {detector_type} 中没有模型 {model_name}")]
  UnknownModel {
    detector_type: String,
    model_name: String,
  },
  #[error("检测器类型重复: {0}")]
  DuplicateDetectorType(String),
  #[error("检测器 {0} 没有配置任何模型")]
  NoBackends(String),
  #[error("检测器 {detector_type} 中模型名重复: {model_name}")]
  DuplicateModel {
    detector_type: String,
    model_name: String,
  },
  #[error("模型 {model_name} 的阈值超出 [0, 1]: {value}")]
  InvalidThreshold { model_name: String, value: f32 },
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  Parse(#[from] serde_json::Error),
}

/// 模型后端能力：输出边界框，或输出类别分数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
  Bbox,
  Classify,
}

impl fmt::Display for BackendKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BackendKind::Bbox => write!(f, "bbox"),
      BackendKind::Classify => write!(f, "classify"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
  pub model_name: String,
  pub kind: BackendKind,
  pub storage_path: PathBuf,
  #[serde(default = "default_confidence_threshold")]
  pub confidence_threshold: f32,
  /// 有序标签集；检测模型可以不提供，由后端动态给出类别名
  #[serde(default)]
  pub labels: Option<Vec<String>>,
  #[serde(default)]
  pub input_size: Option<u32>,
  #[serde(default = "default_iou_threshold")]
  pub iou_threshold: f32,
  #[serde(default)]
  pub description: String,
}

fn default_confidence_threshold() -> f32 {
  DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_iou_threshold() -> f32 {
  DEFAULT_IOU_THRESHOLD
}

fn default_enabled() -> bool {
  true
}

impl BackendConfig {
  pub fn bbox(model_name: &str, storage_path: impl Into<PathBuf>, threshold: f32) -> Self {
    Self {
      model_name: model_name.to_string(),
      kind: BackendKind::Bbox,
      storage_path: storage_path.into(),
      confidence_threshold: threshold,
      labels: None,
      input_size: None,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      description: String::new(),
    }
  }

  pub fn classify(model_name: &str, storage_path: impl Into<PathBuf>, labels: &[&str]) -> Self {
    Self {
      model_name: model_name.to_string(),
      kind: BackendKind::Classify,
      storage_path: storage_path.into(),
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      labels: Some(labels.iter().map(|l| l.to_string()).collect()),
      input_size: None,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      description: String::new(),
    }
  }

  pub fn with_labels(mut self, labels: &[&str]) -> Self {
    self.labels = Some(labels.iter().map(|l| l.to_string()).collect());
    self
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_description(mut self, description: &str) -> Self {
    self.description = description.to_string();
    self
  }

  /// 模型期望的输入边长（正方形）
  pub fn input_size(&self) -> u32 {
    self.input_size.unwrap_or(match self.kind {
      BackendKind::Bbox => DEFAULT_BBOX_INPUT_SIZE,
      BackendKind::Classify => DEFAULT_CLASSIFY_INPUT_SIZE,
    })
  }

  pub fn label(&self, index: usize) -> Option<&str> {
    self
      .labels
      .as_ref()
      .and_then(|labels| labels.get(index))
      .map(String::as_str)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
  pub detector_type: String,
  #[serde(default)]
  pub display_name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default)]
  pub order: i32,
  pub backends: Vec<BackendConfig>,
}

impl DetectorConfig {
  pub fn new(detector_type: &str, backends: Vec<BackendConfig>) -> Self {
    Self {
      detector_type: detector_type.to_string(),
      display_name: title_case(detector_type),
      description: String::new(),
      enabled: true,
      order: 0,
      backends,
    }
  }

  pub fn with_description(mut self, description: &str) -> Self {
    self.description = description.to_string();
    self
  }

  pub fn with_order(mut self, order: i32) -> Self {
    self.order = order;
    self
  }
}

/// 目录中单个检测器的展示信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorSummary {
  pub detector_type: String,
  pub display_name: String,
  pub description: String,
  pub enabled: bool,
}

#[derive(Deserialize)]
struct RegistryFile {
  detectors: Vec<DetectorConfig>,
}

/// 检测器类型到模型后端的静态目录，初始化后只读
#[derive(Debug, Clone)]
pub struct ModelRegistry {
  detectors: Vec<DetectorConfig>,
}

impl ModelRegistry {
  pub fn new(detectors: Vec<DetectorConfig>) -> Result<Self, RegistryError> {
    let mut seen = HashSet::new();
    for detector in &detectors {
      if !seen.insert(detector.detector_type.as_str()) {
        return Err(RegistryError::DuplicateDetectorType(
          detector.detector_type.clone(),
        ));
      }
      if detector.backends.is_empty() {
        return Err(RegistryError::NoBackends(detector.detector_type.clone()));
      }

      let mut models = HashSet::new();
      for backend in &detector.backends {
        if !models.insert(backend.model_name.as_str()) {
          return Err(RegistryError::DuplicateModel {
            detector_type: detector.detector_type.clone(),
            model_name: backend.model_name.clone(),
          });
        }
        for value in [backend.confidence_threshold, backend.iou_threshold] {
          if !(0.0..=1.0).contains(&value) {
            return Err(RegistryError::InvalidThreshold {
              model_name: backend.model_name.clone(),
              value,
            });
          }
        }
      }
    }

    debug!("模型目录包含 {} 个检测器", detectors.len());
    Ok(Self { detectors })
  }

  /// 站点默认部署的四个检测器，模型文件位于 `models_root` 下
  pub fn builtin(models_root: impl AsRef<Path>) -> Self {
    let root = models_root.as_ref();
    let detectors = vec![
      DetectorConfig::new(
        OBJECT_DETECTION,
        vec![
          BackendConfig::bbox("yolo11m", root.join("yolo11m.onnx"), 0.25)
            .with_description("General object recognition (people, vehicles, etc.)"),
        ],
      )
      .with_description("General object recognition (people, vehicles, etc.)")
      .with_order(0),
      DetectorConfig::new(
        MILITARY_DETECTION,
        vec![
          BackendConfig::bbox(
            "yolo11m_military",
            root.join("yolo11m-military.onnx"),
            0.3,
          )
          .with_description("Military objects detection (vehicles, weapons, soldiers, etc.)"),
        ],
      )
      .with_description("Military objects detection (vehicles, weapons, soldiers, etc.)")
      .with_order(1),
      DetectorConfig::new(
        DAMAGE_ASSESSMENT,
        vec![
          BackendConfig::classify(
            "xbd_classifier",
            root.join("xbd_damage_classifier.onnx"),
            &["no_damage", "minor_damage", "major_damage", "destroyed"],
          )
          .with_description("Building damage assessment from satellite imagery"),
        ],
      )
      .with_description("Building damage assessment from satellite imagery")
      .with_order(2),
      DetectorConfig::new(
        EMERGENCY_RECOGNITION,
        vec![
          BackendConfig::classify(
            "emergency_net",
            root.join("emergency_net.onnx"),
            &[
              "normal",
              "fire",
              "flood",
              "explosion",
              "collapse",
              "other_emergency",
            ],
          )
          .with_description("Emergency situation recognition"),
        ],
      )
      .with_description("Emergency situation recognition")
      .with_order(3),
    ];

    Self { detectors }
  }

  pub fn from_json_str(text: &str) -> Result<Self, RegistryError> {
    let file: RegistryFile = serde_json::from_str(text)?;
    Self::new(file.detectors)
  }

  /// 从 JSON 文件加载目录，相对模型路径以该文件所在目录为基准
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
    let path = path.as_ref();
    info!("加载模型目录: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let mut file: RegistryFile = serde_json::from_str(&text)?;

    if let Some(base) = path.parent() {
      for backend in file.detectors.iter_mut().flat_map(|d| d.backends.iter_mut()) {
        if backend.storage_path.is_relative() {
          backend.storage_path = base.join(&backend.storage_path);
        }
      }
    }

    Self::new(file.detectors)
  }

  pub fn detector(&self, detector_type: &str) -> Option<&DetectorConfig> {
    self
      .detectors
      .iter()
      .find(|d| d.detector_type == detector_type)
  }

  pub fn contains(&self, detector_type: &str) -> bool {
    self.detector(detector_type).is_some()
  }

  pub fn lookup(&self, detector_type: &str) -> Result<&[BackendConfig], RegistryError> {
    let detector = self
      .detector(detector_type)
      .ok_or_else(|| RegistryError::UnknownDetectorType(detector_type.to_string()))?;
    if !detector.enabled {
      return Err(RegistryError::DetectorDisabled(detector_type.to_string()));
    }
    Ok(&detector.backends)
  }

  /// 按注册顺序取第一个后端
  pub fn default_backend(&self, detector_type: &str) -> Result<&BackendConfig, RegistryError> {
    self
      .lookup(detector_type)?
      .first()
      .ok_or_else(|| RegistryError::NoBackends(detector_type.to_string()))
  }

  pub fn backend(
    &self,
    detector_type: &str,
    model_name: Option<&str>,
  ) -> Result<&BackendConfig, RegistryError> {
    let Some(model_name) = model_name else {
      return self.default_backend(detector_type);
    };

    self
      .lookup(detector_type)?
      .iter()
      .find(|b| b.model_name == model_name)
      .ok_or_else(|| RegistryError::UnknownModel {
        detector_type: detector_type.to_string(),
        model_name: model_name.to_string(),
      })
  }

  /// 按展示顺序排列的检测器
  pub fn detectors(&self) -> Vec<&DetectorConfig> {
    let mut detectors: Vec<_> = self.detectors.iter().collect();
    detectors.sort_by_key(|d| d.order);
    detectors
  }

  pub fn catalog(&self) -> Vec<DetectorSummary> {
    self
      .detectors()
      .into_iter()
      .map(|d| DetectorSummary {
        detector_type: d.detector_type.clone(),
        display_name: if d.display_name.is_empty() {
          title_case(&d.detector_type)
        } else {
          d.display_name.clone()
        },
        description: d.description.clone(),
        enabled: d.enabled,
      })
      .collect()
  }

  pub fn model_description(&self, detector_type: &str, model_name: &str) -> Option<&str> {
    self
      .detector(detector_type)?
      .backends
      .iter()
      .find(|b| b.model_name == model_name)
      .map(|b| b.description.as_str())
  }
}

fn title_case(key: &str) -> String {
  key
    .split('_')
    .filter(|w| !w.is_empty())
    .map(|w| {
      let mut chars = w.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}
