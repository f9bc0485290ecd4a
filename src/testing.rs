// 该文件是 WarTrace 项目的一部分。
// src/testing.rs - 测试用模型桩与数据夹具
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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use crate::cache::ModelCache;
use crate::inference::InferenceAdapter;
use crate::model::{
  BackendError, BackendLoader, ClassifyModel, DetectItem, DetectModel, DetectResult, ModelHandle,
  RgbNhwcTensor,
};
use crate::orchestrator::DetectionOrchestrator;
use crate::output::DirectoryResultStore;
use crate::registry::{BackendConfig, BackendKind, ModelRegistry};
use crate::store::{ContentItem, DetectionStore, DetectorFlags, MediaFile};

/// 创建一个内容任意的模型文件
pub fn touch(dir: &Path, name: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, b"weights").unwrap();
  path
}

/// 写出一张渐变图像，格式由扩展名决定
pub fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
  let path = dir.join(name);
  let image = RgbImage::from_fn(width, height, |x, y| {
    Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
  });
  image.save(&path).unwrap();
  path
}

type DetectFn = dyn Fn(&RgbImage) -> Result<DetectResult, BackendError> + Send + Sync;
type ClassifyFn = dyn Fn(&RgbNhwcTensor) -> Result<Box<[f32]>, BackendError> + Send + Sync;

pub struct StubDetector {
  infer: Box<DetectFn>,
  names: HashMap<u32, String>,
}

impl StubDetector {
  pub fn empty() -> Self {
    Self::returning(Vec::new())
  }

  pub fn returning(items: Vec<DetectItem>) -> Self {
    Self::from_fn(move |_| Ok(DetectResult::from(items.clone())))
  }

  pub fn from_fn(
    f: impl Fn(&RgbImage) -> Result<DetectResult, BackendError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      infer: Box::new(f),
      names: HashMap::new(),
    }
  }

  pub fn with_names(mut self, names: &[(u32, &str)]) -> Self {
    self.names = names.iter().map(|(id, n)| (*id, n.to_string())).collect();
    self
  }
}

impl DetectModel for StubDetector {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, BackendError> {
    (self.infer)(image)
  }

  fn class_name(&self, class_id: u32) -> Option<String> {
    self.names.get(&class_id).cloned()
  }
}

pub struct StubClassifier {
  infer: Box<ClassifyFn>,
}

impl StubClassifier {
  pub fn scores(scores: &[f32]) -> Self {
    let scores = scores.to_vec();
    Self::from_fn(move |_| Ok(scores.clone().into_boxed_slice()))
  }

  pub fn from_fn(
    f: impl Fn(&RgbNhwcTensor) -> Result<Box<[f32]>, BackendError> + Send + Sync + 'static,
  ) -> Self {
    Self { infer: Box::new(f) }
  }
}

impl ClassifyModel for StubClassifier {
  fn infer(&self, input: &RgbNhwcTensor) -> Result<Box<[f32]>, BackendError> {
    (self.infer)(input)
  }
}

/// 记录加载次数的加载器
pub struct CountingLoader {
  kind: BackendKind,
  build: Box<dyn Fn() -> ModelHandle + Send + Sync>,
  delay: Duration,
  pub loads: Arc<AtomicUsize>,
}

impl CountingLoader {
  pub fn detect<M: DetectModel + 'static>(factory: impl Fn() -> M + Send + Sync + 'static) -> Self {
    Self {
      kind: BackendKind::Bbox,
      build: Box::new(move || ModelHandle::Detect(Box::new(factory()))),
      delay: Duration::ZERO,
      loads: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn classify<M: ClassifyModel + 'static>(
    factory: impl Fn() -> M + Send + Sync + 'static,
  ) -> Self {
    Self {
      kind: BackendKind::Classify,
      build: Box::new(move || ModelHandle::Classify(Box::new(factory()))),
      delay: Duration::ZERO,
      loads: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn with_delay_ms(mut self, ms: u64) -> Self {
    self.delay = Duration::from_millis(ms);
    self
  }

  /// 以另一种后端能力注册，用于模拟加载结果与配置不符
  pub fn reporting(mut self, kind: BackendKind) -> Self {
    self.kind = kind;
    self
  }
}

impl BackendLoader for CountingLoader {
  fn kind(&self) -> BackendKind {
    self.kind
  }

  fn load(&self, _config: &BackendConfig) -> Result<ModelHandle, BackendError> {
    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }
    self.loads.fetch_add(1, Ordering::SeqCst);
    Ok((self.build)())
  }
}

/// 检测器桩的默认输出：一个高分目标和一个低于阈值的目标
pub fn default_items() -> Vec<DetectItem> {
  vec![
    DetectItem {
      class_id: 0,
      score: 0.92,
      bbox: [0.1, 0.1, 0.6, 0.9],
    },
    DetectItem {
      class_id: 2,
      score: 0.05,
      bbox: [0.0, 0.0, 0.2, 0.2],
    },
  ]
}

/// 临时目录、内存数据库、全部模型文件齐备的内置目录
pub struct Fixture {
  pub dir: TempDir,
  pub store: Arc<DetectionStore>,
  pub registry: Arc<ModelRegistry>,
  pub cache: Arc<ModelCache>,
}

impl Fixture {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    for name in [
      "yolo11m.onnx",
      "yolo11m-military.onnx",
      "xbd_damage_classifier.onnx",
      "emergency_net.onnx",
    ] {
      touch(&models, name);
    }
    std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

    let registry = Arc::new(ModelRegistry::builtin(&models));
    let store = Arc::new(DetectionStore::open_in_memory().unwrap());
    let mut fixture = Self {
      dir,
      store,
      cache: Arc::new(ModelCache::new(registry.clone())),
      registry,
    };
    fixture.cache = fixture.cache_with(
      CountingLoader::detect(|| StubDetector::returning(default_items())),
      CountingLoader::classify(|| StubClassifier::scores(&[0.1, 0.2, 0.6, 0.1])),
    );
    fixture
  }

  pub fn cache_with(&self, detect: CountingLoader, classify: CountingLoader) -> Arc<ModelCache> {
    Arc::new(
      ModelCache::new(self.registry.clone())
        .with_loader(detect)
        .with_loader(classify),
    )
  }

  pub fn results_dir(&self) -> PathBuf {
    self.dir.path().join("detection_results")
  }

  pub fn orchestrator(&self) -> DetectionOrchestrator {
    self.orchestrator_with(self.cache.clone())
  }

  pub fn orchestrator_with(&self, cache: Arc<ModelCache>) -> DetectionOrchestrator {
    let results = Arc::new(DirectoryResultStore::new(self.results_dir()));
    DetectionOrchestrator::new(cache, self.store.clone(), InferenceAdapter::new(results))
  }

  pub fn item(&self, flags: DetectorFlags) -> ContentItem {
    self.store.create_content_item("marker", flags).unwrap()
  }

  pub fn image_file(&self, item_id: i64, name: &str) -> MediaFile {
    let path = write_image(&self.dir.path().join("uploads"), name, 64, 48);
    self.store.add_media_file(item_id, &path).unwrap()
  }

  pub fn raw_file(&self, item_id: i64, name: &str, bytes: &[u8]) -> MediaFile {
    let path = self.dir.path().join("uploads").join(name);
    std::fs::write(&path, bytes).unwrap();
    self.store.add_media_file(item_id, &path).unwrap()
  }
}
