// 该文件是 WarTrace 项目的一部分。
// src/settings.rs - 命令行参数配置
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
use std::sync::Arc;

use clap::Args;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  cache::ModelCache,
  inference::InferenceAdapter,
  orchestrator::DetectionOrchestrator,
  output::{DirectoryResultStore, OutputError, draw::Draw},
  registry::ModelRegistry,
  service::{DetectionService, ServiceError},
  store::DetectionStore,
};

/// 检测流水线的公共参数
#[derive(Args, Debug, Clone)]
pub struct PipelineSettings {
  /// SQLite 数据库文件
  #[arg(long, value_name = "FILE", default_value = "wartrace.sqlite3")]
  pub database: PathBuf,

  /// 模型文件目录（使用内置检测器目录时）
  #[arg(long, value_name = "DIR", default_value = "models")]
  pub models_root: PathBuf,

  /// 检测器目录 JSON 文件，指定后忽略 --models-root
  #[arg(long, value_name = "FILE")]
  pub registry: Option<PathBuf>,

  /// 标注图像输出位置
  /// 例如: folder:///srv/media/detection_results?prefix=/detection_results&dated
  #[arg(long, value_name = "URL", default_value = "folder:///tmp/detection_results")]
  pub results: Url,

  /// 标注文字使用的字体文件（不指定时只绘制边框）
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

impl PipelineSettings {
  pub fn load_registry(&self) -> Result<ModelRegistry, ServiceError> {
    let registry = match &self.registry {
      Some(path) => {
        info!("加载检测器目录: {}", path.display());
        ModelRegistry::from_json_file(path)?
      }
      None => {
        info!("使用内置检测器目录, 模型目录: {}", self.models_root.display());
        ModelRegistry::builtin(&self.models_root)
      }
    };
    Ok(registry)
  }

  pub fn build_service(&self) -> Result<DetectionService, ServiceError> {
    let results = Arc::new(DirectoryResultStore::from_url(&self.results)?);
    let registry = Arc::new(self.load_registry()?);
    let store = Arc::new(DetectionStore::open(&self.database)?);

    let draw = match &self.font {
      Some(path) => Draw::default()
        .with_font_file(path)
        .map_err(OutputError::from)?,
      None => Draw::default(),
    };

    let cache = ModelCache::new(registry);
    #[cfg(feature = "onnx")]
    let cache = cache.with_onnx_loaders();

    let adapter = InferenceAdapter::new(results).with_draw(draw);
    let orchestrator = DetectionOrchestrator::new(Arc::new(cache), store, adapter);
    Ok(DetectionService::new(orchestrator))
  }
}
