// 该文件是 WarTrace 项目的一部分。
// src/output.rs - 标注结果输出定义
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

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

pub mod draw;

mod directory_record;
pub use self::directory_record::DirectoryResultStore;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
}

/// 写入结果目录的标注图像
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredImage {
  /// 文件系统路径
  pub path: PathBuf,
  /// 对外可访问的相对路径，例如 `/detection_results/det_a_1700000000.jpg`
  pub relative_path: String,
}

/// 标注图像的存储位置。检测适配器只通过这个接口写文件。
pub trait ResultStore: Send + Sync {
  fn save_image(&self, file_name: &str, image: &RgbImage) -> Result<StoredImage, OutputError>;
}
