// 该文件是 WarTrace 项目的一部分。
// src/cache.rs - 模型缓存
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
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{BackendError, BackendLoader, ModelHandle};
use crate::registry::{BackendConfig, BackendKind, ModelRegistry, RegistryError};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型目录错误: {0}")]
  Registry(#[from] RegistryError),
  #[error("模型文件不存在: {0}")]
  ModelArtifactMissing(PathBuf),
  #[error("没有可用于 {0} 后端的加载器")]
  UnsupportedBackendKind(BackendKind),
  #[error("模型 {model_name} 配置为 {expected} 后端, 加载结果为 {actual}")]
  KindMismatch {
    model_name: String,
    expected: BackendKind,
    actual: BackendKind,
  },
  #[error("模型 {model_name} 加载失败: {source}")]
  LoadFailed {
    model_name: String,
    #[source]
    source: BackendError,
  },
  #[error("模型缓存锁已损坏")]
  Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModelKey {
  detector_type: String,
  model_name: String,
}

/// 缓存中的模型实例及其配置
#[derive(Debug)]
pub struct LoadedModel {
  pub detector_type: String,
  pub config: BackendConfig,
  pub handle: ModelHandle,
  pub loaded_at: DateTime<Utc>,
}

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

/// 按 (检测器类型, 模型名) 懒加载并常驻的模型缓存。
///
/// 每个键对应一个 `OnceCell`：同一个键的并发首次请求只有一个会执行加载，
/// 其余调用阻塞等待结果；不同键之间互不阻塞。加载失败不会写入缓存，之后的请求会重试。
pub struct ModelCache {
  registry: Arc<ModelRegistry>,
  loaders: HashMap<BackendKind, Box<dyn BackendLoader>>,
  slots: Mutex<HashMap<ModelKey, Slot>>,
}

impl ModelCache {
  pub fn new(registry: Arc<ModelRegistry>) -> Self {
    Self {
      registry,
      loaders: HashMap::new(),
      slots: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_loader(mut self, loader: impl BackendLoader + 'static) -> Self {
    let kind = loader.kind();
    debug!("注册 {} 加载器", kind);
    self.loaders.insert(kind, Box::new(loader));
    self
  }

  #[cfg(feature = "onnx")]
  pub fn with_onnx_loaders(self) -> Self {
    self
      .with_loader(crate::model::OnnxDetectorLoader)
      .with_loader(crate::model::OnnxClassifierLoader)
  }

  pub fn registry(&self) -> &Arc<ModelRegistry> {
    &self.registry
  }

  /// 获取模型实例，`model_name` 为空时使用检测器的默认后端
  pub fn get(
    &self,
    detector_type: &str,
    model_name: Option<&str>,
  ) -> Result<Arc<LoadedModel>, ModelError> {
    let config = self.registry.backend(detector_type, model_name)?;
    let key = ModelKey {
      detector_type: detector_type.to_string(),
      model_name: config.model_name.clone(),
    };

    let slot = {
      let mut slots = self.slots.lock().map_err(|_| ModelError::Poisoned)?;
      slots.entry(key).or_default().clone()
    };

    slot
      .get_or_try_init(|| self.load(detector_type, config).map(Arc::new))
      .cloned()
  }

  fn load(&self, detector_type: &str, config: &BackendConfig) -> Result<LoadedModel, ModelError> {
    info!(
      "加载模型 {}/{}: {}",
      detector_type,
      config.model_name,
      config.storage_path.display()
    );

    if !config.storage_path.exists() {
      error!("模型文件不存在: {}", config.storage_path.display());
      return Err(ModelError::ModelArtifactMissing(
        config.storage_path.clone(),
      ));
    }

    let loader = self
      .loaders
      .get(&config.kind)
      .ok_or(ModelError::UnsupportedBackendKind(config.kind))?;

    let now = std::time::Instant::now();
    let handle = loader
      .load(config)
      .map_err(|source| ModelError::LoadFailed {
        model_name: config.model_name.clone(),
        source,
      })?;

    if handle.kind() != config.kind {
      return Err(ModelError::KindMismatch {
        model_name: config.model_name.clone(),
        expected: config.kind,
        actual: handle.kind(),
      });
    }

    info!("模型 {} 加载完成，耗时: {:.2?}", config.model_name, now.elapsed());
    Ok(LoadedModel {
      detector_type: detector_type.to_string(),
      config: config.clone(),
      handle,
      loaded_at: Utc::now(),
    })
  }

  /// 已成功加载的模型数量
  pub fn loaded_count(&self) -> usize {
    self
      .slots
      .lock()
      .map(|slots| slots.values().filter(|s| s.get().is_some()).count())
      .unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{BackendConfig, DetectorConfig, OBJECT_DETECTION};
  use crate::testing::{CountingLoader, StubClassifier, StubDetector, touch};
  use std::sync::atomic::Ordering;

  fn registry_with(path: PathBuf) -> Arc<ModelRegistry> {
    Arc::new(
      ModelRegistry::new(vec![
        DetectorConfig::new(
          OBJECT_DETECTION,
          vec![
            BackendConfig::bbox("yolo", path.clone(), 0.25),
            BackendConfig::bbox("yolo_alt", path.clone(), 0.25),
          ],
        ),
        DetectorConfig::new(
          "damage_assessment",
          vec![BackendConfig::classify("xbd", path, &["no", "yes"])],
        ),
      ])
      .unwrap(),
    )
  }

  #[test]
  fn loads_each_key_once() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = touch(dir.path(), "model.onnx");
    let loader = CountingLoader::detect(StubDetector::empty);
    let loads = loader.loads.clone();
    let cache = ModelCache::new(registry_with(artifact)).with_loader(loader);

    let first = cache.get(OBJECT_DETECTION, None).unwrap();
    let second = cache.get(OBJECT_DETECTION, Some("yolo")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    cache.get(OBJECT_DETECTION, Some("yolo_alt")).unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(cache.loaded_count(), 2);
  }

  #[test]
  fn concurrent_first_requests_share_one_load() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = touch(dir.path(), "model.onnx");
    let loader = CountingLoader::detect(StubDetector::empty).with_delay_ms(50);
    let loads = loader.loads.clone();
    let cache = Arc::new(ModelCache::new(registry_with(artifact)).with_loader(loader));

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let cache = cache.clone();
        std::thread::spawn(move || cache.get(OBJECT_DETECTION, None).map(|_| ()))
      })
      .collect();
    for handle in handles {
      handle.join().unwrap().unwrap();
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn missing_artifact_is_reported_and_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("absent.onnx");
    let cache = ModelCache::new(registry_with(artifact.clone()))
      .with_loader(CountingLoader::detect(StubDetector::empty));

    assert!(matches!(
      cache.get(OBJECT_DETECTION, None),
      Err(ModelError::ModelArtifactMissing(p)) if p == artifact
    ));
    assert_eq!(cache.loaded_count(), 0);

    std::fs::write(&artifact, b"weights").unwrap();
    assert!(cache.get(OBJECT_DETECTION, None).is_ok());
  }

  #[test]
  fn kind_without_loader_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = touch(dir.path(), "model.onnx");
    let cache = ModelCache::new(registry_with(artifact))
      .with_loader(CountingLoader::detect(StubDetector::empty));

    assert!(matches!(
      cache.get("damage_assessment", None),
      Err(ModelError::UnsupportedBackendKind(BackendKind::Classify))
    ));
  }

  #[test]
  fn loader_returning_wrong_capability_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = touch(dir.path(), "model.onnx");
    let cache = ModelCache::new(registry_with(artifact)).with_loader(
      CountingLoader::classify(|| StubClassifier::scores(&[0.5])).reporting(BackendKind::Bbox),
    );

    assert!(matches!(
      cache.get(OBJECT_DETECTION, None),
      Err(ModelError::KindMismatch { .. })
    ));
  }

  #[test]
  fn unknown_detector_type_surfaces_registry_error() {
    let cache = ModelCache::new(Arc::new(ModelRegistry::builtin("/nowhere")));
    assert!(matches!(
      cache.get("thermal", None),
      Err(ModelError::Registry(RegistryError::UnknownDetectorType(_)))
    ));
  }
}
