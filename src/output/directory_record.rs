// 该文件是 WarTrace 项目的一部分。
// src/output/directory_record.rs - 结果目录输出
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

use chrono::{Datelike, Utc};
use image::RgbImage;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{OutputError, ResultStore, StoredImage},
};

const DEFAULT_URL_PREFIX: &str = "/detection_results";

/// 把标注图像写入本地目录，`dated` 时按 年/月/日 分子目录
#[derive(Debug, Clone)]
pub struct DirectoryResultStore {
  directory: PathBuf,
  url_prefix: String,
  dated: bool,
}

impl FromUrlWithScheme for DirectoryResultStore {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryResultStore {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: uri.scheme().to_string(),
      });
    }

    let mut store = DirectoryResultStore::new(uri.path());
    for (k, v) in uri.query_pairs() {
      match k.as_ref() {
        "prefix" => store.url_prefix = v.trim_end_matches('/').to_string(),
        "dated" => store.dated = true,
        _ => {}
      }
    }
    Ok(store)
  }
}

impl DirectoryResultStore {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      url_prefix: DEFAULT_URL_PREFIX.to_string(),
      dated: false,
    }
  }

  pub fn with_url_prefix(mut self, prefix: &str) -> Self {
    self.url_prefix = prefix.trim_end_matches('/').to_string();
    self
  }

  pub fn dated(mut self, dated: bool) -> Self {
    self.dated = dated;
    self
  }

  pub fn directory(&self) -> &PathBuf {
    &self.directory
  }

  // 相对于结果目录的子路径
  fn sub_directory(&self) -> Option<String> {
    if !self.dated {
      return None;
    }
    let now = Utc::now();
    Some(format!(
      "{}/{:02}/{:02}",
      now.year(),
      now.month(),
      now.day()
    ))
  }
}

impl ResultStore for DirectoryResultStore {
  fn save_image(&self, file_name: &str, image: &RgbImage) -> Result<StoredImage, OutputError> {
    let sub = self.sub_directory();
    let directory = match &sub {
      Some(sub) => self.directory.join(sub),
      None => self.directory.clone(),
    };
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    let path = directory.join(file_name);
    image.save(&path)?;
    debug!("保存标注图像: {}", path.display());

    let relative_path = match sub {
      Some(sub) => format!("{}/{}/{}", self.url_prefix, sub, file_name),
      None => format!("{}/{}", self.url_prefix, file_name),
    };

    Ok(StoredImage {
      path,
      relative_path,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_from_folder_url() {
    let url = Url::parse("folder:///srv/media/results?prefix=/media/results/&dated").unwrap();
    let store = DirectoryResultStore::from_url(&url).unwrap();
    assert_eq!(store.directory, PathBuf::from("/srv/media/results"));
    assert_eq!(store.url_prefix, "/media/results");
    assert!(store.dated);
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("s3://bucket/results").unwrap();
    assert!(matches!(
      DirectoryResultStore::from_url(&url),
      Err(OutputError::SchemeMismatch { .. })
    ));
  }

  #[test]
  fn saves_image_and_reports_relative_path() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryResultStore::new(dir.path().join("detection_results"));
    let stored = store.save_image("det_a_1.jpg", &RgbImage::new(8, 8)).unwrap();

    assert!(stored.path.exists());
    assert_eq!(stored.relative_path, "/detection_results/det_a_1.jpg");
  }

  #[test]
  fn dated_store_shards_by_day() {
    let dir = tempfile::tempdir().unwrap();
    let store = DirectoryResultStore::new(dir.path()).dated(true);
    let stored = store.save_image("det_b_2.png", &RgbImage::new(4, 4)).unwrap();

    assert!(stored.path.exists());
    let today = Utc::now();
    assert!(
      stored
        .relative_path
        .starts_with(&format!("/detection_results/{}/", today.year()))
    );
  }
}
