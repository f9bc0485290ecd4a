// 该文件是 WarTrace 项目的一部分。
// src/bin/process_file.rs - 处理单个媒体文件
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

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wartrace_detection::settings::PipelineSettings;

/// 对单个媒体文件运行指定的检测器
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 媒体文件 id
  #[arg(value_name = "FILE_ID")]
  pub file_id: i64,

  /// 检测器类型，可重复；不指定时使用所属条目的开关
  #[arg(long = "detector", value_name = "TYPE")]
  pub detectors: Vec<String>,

  #[command(flatten)]
  pub settings: PipelineSettings,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  info!("数据库: {}", args.settings.database.display());

  let service = args.settings.build_service()?;
  let outcome = service.process_file(args.file_id, &args.detectors)?;
  if let Some(reason) = &outcome.skipped {
    warn!("文件 #{} 被跳过: {:?}", args.file_id, reason);
  }

  let report = service.file_report(args.file_id)?;
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(())
}
