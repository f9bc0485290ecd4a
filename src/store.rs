// 该文件是 WarTrace 项目的一部分。
// src/store.rs - 检测结果持久化
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

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tracing::{debug, info};

mod migrations;
pub mod records;
mod repository;

pub use self::records::{
  ClassificationRow, ContentItem, Detection, DetectionDetails, DetectorFlags, MediaFile,
  NewDetection, NewSegmentationMask, ObjectDetectionRow, SegmentationMaskRow,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("数据库错误: {0}")]
  Database(rusqlite::Error),
  #[error("违反约束: {0}")]
  Constraint(String),
  #[error("检测结果已存在: 文件 {media_file_id}, 检测器 {detector_type}")]
  DuplicateDetection {
    media_file_id: i64,
    detector_type: String,
  },
  #[error("数据库繁忙: {0}")]
  Busy(String),
  #[error("数据库连接锁已中毒")]
  Poisoned,
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    match &e {
      rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
        StoreError::Constraint(msg.clone().unwrap_or_else(|| err.to_string()))
      }
      // 等待超时后其他进程仍持有写锁，只影响这一次写入
      rusqlite::Error::SqliteFailure(err, msg)
        if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
      {
        StoreError::Busy(msg.clone().unwrap_or_else(|| err.to_string()))
      }
      _ => StoreError::Database(e),
    }
  }
}

impl StoreError {
  /// 连接或锁出错时整个批次都无法继续
  pub fn is_fatal(&self) -> bool {
    matches!(self, StoreError::Database(_) | StoreError::Poisoned)
  }
}

/// SQLite 上的检测结果存储，连接由互斥锁串行化
pub struct DetectionStore {
  conn: Mutex<Connection>,
}

impl DetectionStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref();
    info!("打开检测数据库: {}", path.display());
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    migrations::run_migrations(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn with_conn<T>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
  ) -> Result<T, StoreError> {
    let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
    f(&mut conn)
  }

  pub fn create_content_item(
    &self,
    title: &str,
    flags: DetectorFlags,
  ) -> Result<ContentItem, StoreError> {
    self.with_conn(|conn| {
      let now = Utc::now();
      let id = repository::insert_content_item(conn, title, &flags, now)?;
      Ok(ContentItem {
        id,
        title: title.to_string(),
        flags,
        created_at: now,
      })
    })
  }

  pub fn content_item(&self, id: i64) -> Result<Option<ContentItem>, StoreError> {
    self.with_conn(|conn| repository::get_content_item(conn, id))
  }

  /// 返回条目是否存在
  pub fn set_detector_flags(&self, id: i64, flags: DetectorFlags) -> Result<bool, StoreError> {
    self.with_conn(|conn| Ok(repository::update_detector_flags(conn, id, &flags)? > 0))
  }

  /// 级联删除其媒体文件与检测结果
  pub fn delete_content_item(&self, id: i64) -> Result<bool, StoreError> {
    self.with_conn(|conn| Ok(repository::delete_content_item(conn, id)? > 0))
  }

  pub fn add_media_file(&self, item_id: i64, path: &Path) -> Result<MediaFile, StoreError> {
    self.with_conn(|conn| {
      let now = Utc::now();
      let id = repository::insert_media_file(conn, item_id, path, now)?;
      Ok(MediaFile {
        id,
        item_id,
        path: path.to_path_buf(),
        uploaded_at: now,
      })
    })
  }

  pub fn media_file(&self, id: i64) -> Result<Option<MediaFile>, StoreError> {
    self.with_conn(|conn| repository::get_media_file(conn, id))
  }

  /// 按 id 升序
  pub fn media_files_for_item(&self, item_id: i64) -> Result<Vec<MediaFile>, StoreError> {
    self.with_conn(|conn| repository::list_media_files(conn, item_id))
  }

  pub fn delete_media_file(&self, id: i64) -> Result<bool, StoreError> {
    self.with_conn(|conn| Ok(repository::delete_media_file(conn, id)? > 0))
  }

  pub fn detections_for_file(&self, media_file_id: i64) -> Result<Vec<Detection>, StoreError> {
    self.with_conn(|conn| repository::list_detections(conn, media_file_id))
  }

  pub fn detection(
    &self,
    media_file_id: i64,
    detector_type: &str,
  ) -> Result<Option<Detection>, StoreError> {
    self.with_conn(|conn| repository::get_detection(conn, media_file_id, detector_type))
  }

  pub fn detection_count(&self) -> Result<i64, StoreError> {
    self.with_conn(|conn| repository::count_detections(conn))
  }

  /// 在一个事务中写入检测主记录和全部子记录，子记录失败时整条回滚。
  pub fn record_detection(&self, new: &NewDetection) -> Result<Detection, StoreError> {
    self.with_conn(|conn| {
      let now = Utc::now();
      let tx = conn.transaction()?;
      let id = repository::insert_detection(&tx, new, now)?;
      repository::insert_children(&tx, id, new)?;
      tx.commit()?;

      debug!(
        "写入检测结果 #{}: 文件 {}, {} ({}), 目标 {} 个, 分类 {} 个",
        id,
        new.media_file_id,
        new.detector_type,
        new.model_name,
        new.objects.len(),
        new.classifications.len()
      );

      Ok(Detection {
        id,
        media_file_id: new.media_file_id,
        detector_type: new.detector_type.clone(),
        model_name: new.model_name.clone(),
        summary: new.summary.clone(),
        result_path: new.result_path.clone(),
        created_at: now,
        updated_at: now,
      })
    })
  }

  /// 文件的全部检测结果及子记录
  pub fn file_details(&self, media_file_id: i64) -> Result<Vec<DetectionDetails>, StoreError> {
    self.with_conn(|conn| {
      let conn: &Connection = conn;
      repository::list_detections(conn, media_file_id)?
        .into_iter()
        .map(|detection| {
          Ok(DetectionDetails {
            objects: repository::list_object_detections(conn, detection.id)?,
            classifications: repository::list_classifications(conn, detection.id)?,
            segmentation_masks: repository::list_segmentation_masks(conn, detection.id)?,
            detection,
          })
        })
        .collect()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::inference::LabelScore;
  use crate::model::{BoundingBox, DetectedObject};

  fn store_with_file() -> (DetectionStore, MediaFile) {
    let store = DetectionStore::open_in_memory().unwrap();
    let item = store
      .create_content_item("marker", DetectorFlags::all())
      .unwrap();
    let file = store
      .add_media_file(item.id, Path::new("/media/a.jpg"))
      .unwrap();
    (store, file)
  }

  #[test]
  fn record_detection_is_unique_per_type() {
    let (store, file) = store_with_file();
    let new = NewDetection::new(file.id, "object_detection", "yolo11m", "Found 0 objects");

    let first = store.record_detection(&new).unwrap();
    assert_eq!(first.detector_type, "object_detection");

    let second = store.record_detection(&new);
    assert!(matches!(second, Err(StoreError::DuplicateDetection { .. })));
    assert!(!second.unwrap_err().is_fatal());
    assert_eq!(store.detection_count().unwrap(), 1);
  }

  #[test]
  fn failed_child_rolls_back_parent() {
    let (store, file) = store_with_file();
    let mut new = NewDetection::new(file.id, "object_detection", "yolo11m", "Found 1 objects");
    new.objects = vec![DetectedObject {
      label: "tank".to_string(),
      confidence: -0.2,
      bbox: BoundingBox::from_corners(0.0, 0.0, 3.0, 3.0),
    }];

    let err = store.record_detection(&new).unwrap_err();
    assert!(matches!(err, StoreError::Constraint(_)));
    assert!(!err.is_fatal());
    assert!(store.detections_for_file(file.id).unwrap().is_empty());

    new.objects[0].confidence = 0.6;
    store.record_detection(&new).unwrap();
    assert_eq!(store.detections_for_file(file.id).unwrap().len(), 1);
  }

  #[test]
  fn file_details_include_every_child_kind() {
    let (store, file) = store_with_file();
    let mut new = NewDetection::new(file.id, "damage_assessment", "xbd_classifier", "");
    new.classifications = vec![
      LabelScore {
        label: "major_damage".to_string(),
        confidence: 0.6,
      },
      LabelScore {
        label: "no_damage".to_string(),
        confidence: 0.1,
      },
    ];
    new.masks = vec![NewSegmentationMask {
      label: "rubble".to_string(),
      mask_path: "/masks/a.png".to_string(),
      confidence: 0.5,
      metadata: Some(serde_json::json!({"pixels": 1200})),
    }];
    store.record_detection(&new).unwrap();

    let details = store.file_details(file.id).unwrap();
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].classifications[0].label, "major_damage");
    assert_eq!(details[0].segmentation_masks[0].mask_path, "/masks/a.png");
    assert_eq!(
      details[0].segmentation_masks[0].metadata,
      Some(serde_json::json!({"pixels": 1200}))
    );

    let json = serde_json::to_value(&details[0]).unwrap();
    assert_eq!(json["detector_type"], "damage_assessment");
  }

  #[test]
  fn lock_contention_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    DetectionStore::open(&path).unwrap();

    let holder = Connection::open(&path).unwrap();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();
    let other = Connection::open(&path).unwrap();
    other.busy_timeout(Duration::ZERO).unwrap();

    let err = StoreError::from(other.execute_batch("BEGIN IMMEDIATE").unwrap_err());
    assert!(matches!(err, StoreError::Busy(_)));
    assert!(!err.is_fatal());
    holder.execute_batch("ROLLBACK").unwrap();
  }

  #[test]
  fn deleting_file_cascades() {
    let (store, file) = store_with_file();
    store
      .record_detection(&NewDetection::new(file.id, "object_detection", "yolo11m", ""))
      .unwrap();
    assert!(store.delete_media_file(file.id).unwrap());
    assert_eq!(store.detection_count().unwrap(), 0);
    assert!(!store.delete_media_file(file.id).unwrap());
  }

  #[test]
  fn file_database_persists_between_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wartrace.sqlite3");
    let item_id = {
      let store = DetectionStore::open(&path).unwrap();
      store
        .create_content_item("persisted", DetectorFlags::default())
        .unwrap()
        .id
    };
    let store = DetectionStore::open(&path).unwrap();
    let item = store.content_item(item_id).unwrap().unwrap();
    assert_eq!(item.title, "persisted");
    assert!(item.enabled_detector_types().is_empty());
  }
}
