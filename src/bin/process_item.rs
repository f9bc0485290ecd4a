// 该文件是 WarTrace 项目的一部分。
// src/bin/process_item.rs - 处理内容条目下的全部媒体文件
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
use tracing::info;
use tracing_subscriber::EnvFilter;

use wartrace_detection::settings::PipelineSettings;

/// 按条目的检测开关处理其全部媒体文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 内容条目 id
  #[arg(value_name = "ITEM_ID")]
  pub item_id: i64,

  /// 同时输出条目的检测报告（JSON）
  #[arg(long)]
  pub report: bool,

  #[command(flatten)]
  pub settings: PipelineSettings,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  info!("数据库: {}", args.settings.database.display());
  info!("结果输出: {}", args.settings.results);

  let service = args.settings.build_service()?;
  let summary = service.process_item(args.item_id)?;
  println!("{}", serde_json::to_string_pretty(&summary)?);

  if args.report {
    let report = service.item_report(args.item_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
  }

  Ok(())
}
