// 该文件是 WarTrace 项目的一部分。
// src/bin/detector_catalog.rs - 列出可用检测器
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

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wartrace_detection::ModelRegistry;

/// 打印检测器目录
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件目录（使用内置检测器目录时）
  #[arg(long, value_name = "DIR", default_value = "models")]
  pub models_root: PathBuf,

  /// 检测器目录 JSON 文件
  #[arg(long, value_name = "FILE")]
  pub registry: Option<PathBuf>,

  /// 以 JSON 输出
  #[arg(long)]
  pub json: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .init();

  let args = Args::parse();
  let registry = match &args.registry {
    Some(path) => ModelRegistry::from_json_file(path)?,
    None => ModelRegistry::builtin(&args.models_root),
  };

  let catalog = registry.catalog();
  if args.json {
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    return Ok(());
  }

  for detector in &catalog {
    let state = if detector.enabled { "" } else { " (已停用)" };
    println!(
      "{:<24} {}{}",
      detector.detector_type, detector.display_name, state
    );
    if !detector.description.is_empty() {
      println!("{:<24} {}", "", detector.description);
    }
    for backend in registry.lookup(&detector.detector_type).unwrap_or_default() {
      let exists = if backend.storage_path.exists() { "✓" } else { "✗" };
      println!(
        "{:<24}   - {} [{}] {} {}",
        "",
        backend.model_name,
        backend.kind,
        backend.storage_path.display(),
        exists
      );
    }
  }
  Ok(())
}
