// 该文件是 WarTrace 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 模型后端
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
use std::path::Path;
use std::sync::Mutex;

use image::{RgbImage, imageops::FilterType};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::{Tensor, Value};
use tracing::{debug, info, warn};

use crate::model::{
  BackendError, BackendLoader, ClassifyModel, DetectItem, DetectModel, DetectResult, ModelHandle,
  RgbNhwcTensor,
};
use crate::registry::{BackendConfig, BackendKind};

// YOLO 输出每个候选框的前 4 个值为 cx, cy, w, h
const YOLO_BOX_FIELDS: usize = 4;
const YOLO_MAX_DETECTIONS: usize = 300;

fn build_session(path: &Path) -> Result<Session, BackendError> {
  info!("加载 ONNX 模型: {}", path.display());
  let model_bytes = std::fs::read(path)?;
  debug!(
    "模型文件大小: {:.2} MB",
    model_bytes.len() as f64 / (1024.0 * 1024.0)
  );

  Session::builder()
    .map_err(|e| BackendError::Load(format!("创建会话失败: {e}")))?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(|e| BackendError::Load(format!("设置优化级别失败: {e}")))?
    .commit_from_memory(model_bytes.as_slice())
    .map_err(|e| BackendError::Load(format!("加载模型失败: {e}")))
}

fn first_output_name(session: &Session) -> Result<String, BackendError> {
  session
    .outputs
    .first()
    .map(|o| o.name.clone())
    .ok_or_else(|| BackendError::Load("模型没有输出".to_string()))
}

/// 解析 Ultralytics 导出时写入的 `names` 元数据，形如 `{0: 'person', 1: 'bicycle'}`
fn parse_class_names(raw: &str) -> HashMap<u32, String> {
  raw
    .trim()
    .trim_start_matches('{')
    .trim_end_matches('}')
    .split(',')
    .filter_map(|entry| {
      let (id, name) = entry.split_once(':')?;
      let id = id.trim().parse::<u32>().ok()?;
      let name = name.trim().trim_matches(|c| c == '\'' || c == '"');
      Some((id, name.to_string()))
    })
    .collect()
}

fn read_class_names(session: &Session) -> HashMap<u32, String> {
  match session.metadata().and_then(|m| m.custom("names")) {
    Ok(Some(raw)) => parse_class_names(&raw),
    Ok(None) => HashMap::new(),
    Err(e) => {
      warn!("读取模型类别名失败: {}", e);
      HashMap::new()
    }
  }
}

fn run_session(
  session: &Mutex<Session>,
  output_name: &str,
  input: Value,
) -> Result<(Vec<i64>, Vec<f32>), BackendError> {
  let mut session = session
    .lock()
    .map_err(|_| BackendError::Runtime("会话锁已损坏".to_string()))?;

  let outputs = session
    .run(ort::inputs![input])
    .map_err(|e| BackendError::Runtime(format!("推理失败: {e}")))?;

  let output = outputs
    .get(output_name)
    .ok_or_else(|| BackendError::UnexpectedOutput(format!("缺少输出 {output_name}")))?;

  let (shape, data) = output
    .try_extract_tensor::<f32>()
    .map_err(|e| BackendError::UnexpectedOutput(format!("无法读取输出张量: {e}")))?;

  Ok((shape.iter().copied().collect(), data.to_vec()))
}

pub struct OnnxDetectorLoader;

impl BackendLoader for OnnxDetectorLoader {
  fn kind(&self) -> BackendKind {
    BackendKind::Bbox
  }

  fn load(&self, config: &BackendConfig) -> Result<ModelHandle, BackendError> {
    let session = build_session(&config.storage_path)?;
    let output_name = first_output_name(&session)?;
    let class_names = read_class_names(&session);
    debug!("模型 {} 自带 {} 个类别名", config.model_name, class_names.len());

    Ok(ModelHandle::Detect(Box::new(OnnxDetector {
      session: Mutex::new(session),
      output_name,
      class_names,
      input_size: config.input_size(),
      score_threshold: config.confidence_threshold,
      iou_threshold: config.iou_threshold,
    })))
  }
}

/// YOLOv8/YOLO11 导出的检测模型，输出 `[1, 4 + C, N]`
pub struct OnnxDetector {
  session: Mutex<Session>,
  output_name: String,
  class_names: HashMap<u32, String>,
  input_size: u32,
  score_threshold: f32,
  iou_threshold: f32,
}

impl OnnxDetector {
  fn preprocess(&self, image: &RgbImage) -> Result<Value, BackendError> {
    let size = self.input_size;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let tensor = RgbNhwcTensor::from_rgb_image(&resized);
    let shape = vec![1usize, 3, size as usize, size as usize];

    Tensor::from_array((shape, tensor.to_nchw().into_boxed_slice()))
      .map(Value::from)
      .map_err(|e| BackendError::Runtime(format!("创建输入张量失败: {e}")))
  }

  fn postprocess(&self, shape: &[i64], data: &[f32]) -> Result<DetectResult, BackendError> {
    let (features, candidates) = match shape {
      [1, f, n] => (*f as usize, *n as usize),
      _ => {
        return Err(BackendError::UnexpectedOutput(format!(
          "期望输出形状 [1, 4 + C, N], 实际为 {:?}",
          shape
        )));
      }
    };
    if features <= YOLO_BOX_FIELDS || data.len() < features * candidates {
      return Err(BackendError::UnexpectedOutput(format!(
        "输出大小不匹配: {} 个值, 形状 {:?}",
        data.len(),
        shape
      )));
    }

    let num_classes = features - YOLO_BOX_FIELDS;
    let size = self.input_size as f32;
    let at = |feature: usize, candidate: usize| data[feature * candidates + candidate];

    let mut items = Vec::new();
    for i in 0..candidates {
      let (score, class_id) = (0..num_classes)
        .map(|c| (at(YOLO_BOX_FIELDS + c, i), c as u32))
        .fold((f32::MIN, 0u32), |best, cur| if cur.0 > best.0 { cur } else { best });

      if score < self.score_threshold {
        continue;
      }

      let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
      items.push(DetectItem {
        class_id,
        score,
        bbox: [
          ((cx - w / 2.0) / size).clamp(0.0, 1.0),
          ((cy - h / 2.0) / size).clamp(0.0, 1.0),
          ((cx + w / 2.0) / size).clamp(0.0, 1.0),
          ((cy + h / 2.0) / size).clamp(0.0, 1.0),
        ],
      });
    }

    let kept = non_max_suppression(items, self.iou_threshold);
    debug!("NMS 后保留 {} 个目标", kept.len());
    Ok(DetectResult::from(kept))
  }
}

impl DetectModel for OnnxDetector {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, BackendError> {
    let input = self.preprocess(image)?;
    let (shape, data) = run_session(&self.session, &self.output_name, input)?;
    self.postprocess(&shape, &data)
  }

  fn class_name(&self, class_id: u32) -> Option<String> {
    self.class_names.get(&class_id).cloned()
  }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);
  let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - inter;
  if union <= 0.0 { 0.0 } else { inter / union }
}

/// 按类别做非极大值抑制
fn non_max_suppression(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut kept: Vec<DetectItem> = Vec::new();
  for item in items {
    let overlaps = kept
      .iter()
      .any(|k| k.class_id == item.class_id && iou(&k.bbox, &item.bbox) > iou_threshold);
    if !overlaps {
      kept.push(item);
    }
    if kept.len() >= YOLO_MAX_DETECTIONS {
      break;
    }
  }
  kept
}

pub struct OnnxClassifierLoader;

impl BackendLoader for OnnxClassifierLoader {
  fn kind(&self) -> BackendKind {
    BackendKind::Classify
  }

  fn load(&self, config: &BackendConfig) -> Result<ModelHandle, BackendError> {
    let session = build_session(&config.storage_path)?;
    let output_name = first_output_name(&session)?;

    Ok(ModelHandle::Classify(Box::new(OnnxClassifier {
      session: Mutex::new(session),
      output_name,
    })))
  }
}

/// Keras 导出的分类模型，输入 NHWC
pub struct OnnxClassifier {
  session: Mutex<Session>,
  output_name: String,
}

impl ClassifyModel for OnnxClassifier {
  fn infer(&self, input: &RgbNhwcTensor) -> Result<Box<[f32]>, BackendError> {
    let shape = vec![
      1usize,
      input.height() as usize,
      input.width() as usize,
      input.channels(),
    ];
    let value = Tensor::from_array((shape, input.as_nhwc().to_vec().into_boxed_slice()))
      .map(Value::from)
      .map_err(|e| BackendError::Runtime(format!("创建输入张量失败: {e}")))?;

    let (shape, data) = run_session(&self.session, &self.output_name, value)?;
    debug!("分类输出形状: {:?}", shape);
    if data.is_empty() {
      return Err(BackendError::UnexpectedOutput("分类输出为空".to_string()));
    }
    Ok(data.into_boxed_slice())
  }
}
